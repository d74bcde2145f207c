//! Track allocations and memory use.

use std::cell::Cell;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::Relaxed};

use crate::allocation_tracker::{AllocationTracker, SiteStatistics};
use crate::site::{Site, SiteId, current_site};

/// Only attribute allocations of at least this size to a site.
const TRACK_MINIMUM: usize = 128;

// ----------------------------------------------------------------------------

struct GlobalStats {
    /// Has [`TrackingAllocator`] ever seen an allocation?
    pub installed: AtomicBool,

    /// Total number of allocations minus number of frees.
    pub live_allocs: AtomicUsize,

    /// Total bytes allocated minus those freed.
    pub live_bytes: AtomicUsize,

    /// Do per-site statistics of allocations?
    /// This costs a lock and a hash-map insert per allocation.
    pub track_sites: AtomicBool,

    /// Number of live allocations not tracked by [`AllocationTracker`].
    pub untracked_allocs: AtomicUsize,

    /// Number of live bytes not tracked by [`AllocationTracker`].
    pub untracked_bytes: AtomicUsize,

    /// Cumulative number of allocations done by [`AllocationTracker`] and [`untracked`] sections.
    pub tracker_allocs: AtomicUsize,

    /// Cumulative number of bytes allocated by [`AllocationTracker`] and [`untracked`] sections.
    pub tracker_bytes: AtomicUsize,

    /// Number of allocations [`AllocationTracker`] currently knows about.
    ///
    /// These must still be forgotten when freed, even after tracking has been switched off.
    pub site_allocs: AtomicUsize,
}

// ----------------------------------------------------------------------------

static GLOBAL_STATS: GlobalStats = GlobalStats {
    installed: AtomicBool::new(false),
    live_allocs: AtomicUsize::new(0),
    live_bytes: AtomicUsize::new(0),
    track_sites: AtomicBool::new(false),
    untracked_allocs: AtomicUsize::new(0),
    untracked_bytes: AtomicUsize::new(0),
    tracker_allocs: AtomicUsize::new(0),
    tracker_bytes: AtomicUsize::new(0),
    site_allocs: AtomicUsize::new(0),
};

/// Total number of live allocations,
/// and the number of live bytes allocated as tracked by [`TrackingAllocator`].
///
/// Returns (0,0) if [`TrackingAllocator`] is not used.
pub fn global_allocs_and_bytes() -> (usize, usize) {
    (
        GLOBAL_STATS.live_allocs.load(Relaxed),
        GLOBAL_STATS.live_bytes.load(Relaxed),
    )
}

/// Is [`TrackingAllocator`] the global allocator of this process?
pub fn is_installed() -> bool {
    GLOBAL_STATS.installed.load(Relaxed)
}

/// Are we attributing allocations to sites?
pub fn is_tracking_sites() -> bool {
    GLOBAL_STATS.track_sites.load(Relaxed)
}

/// Should we attribute allocations to sites?
///
/// Returns the previous setting.
pub fn set_tracking_sites(track: bool) -> bool {
    GLOBAL_STATS.track_sites.swap(track, Relaxed)
}

// ----------------------------------------------------------------------------

/// Which live allocation belongs to which site.
static ALLOCATION_TRACKER: LazyLock<parking_lot::Mutex<AllocationTracker>> =
    LazyLock::new(|| parking_lot::Mutex::new(AllocationTracker::default()));

thread_local! {
    /// Used to prevent re-entrancy when tracking allocations.
    ///
    /// Tracking an allocation (inserting into a hash map etc) can itself create allocations.
    /// We don't want to track those allocations, or we will have infinite recursion.
    static IS_THREAD_IN_ALLOCATION_TRACKER: Cell<bool> = const { Cell::new(false) };

    /// Set inside [`untracked`] sections.
    static IS_THREAD_UNTRACKED: Cell<bool> = const { Cell::new(false) };
}

/// Does the current thread hold the tracker lock?
///
/// Threads that are being torn down count as holding it, so we never touch the tracker from them.
fn is_thread_in_allocation_tracker() -> bool {
    IS_THREAD_IN_ALLOCATION_TRACKER
        .try_with(Cell::get)
        .unwrap_or(true)
}

fn is_thread_untracked() -> bool {
    IS_THREAD_UNTRACKED.try_with(Cell::get).unwrap_or(true)
}

fn with_flag<R>(
    flag: &'static std::thread::LocalKey<Cell<bool>>,
    f: impl FnOnce() -> R,
) -> R {
    let previous = flag.try_with(|flag| flag.replace(true)).unwrap_or(true);
    let ret = f();
    flag.try_with(|flag| flag.set(previous)).ok();
    ret
}

/// Run `f` with allocations on this thread hidden from the per-site statistics.
///
/// Use this around book-keeping code (e.g. the tracer itself) so that its own allocations
/// are not attributed to whatever site happens to be active.
/// Frees are still accounted for, so releasing tracked memory in here is fine.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    with_flag(&IS_THREAD_UNTRACKED, f)
}

/// Lock the tracker, making sure the allocations it does are not tracked.
fn with_tracker<R>(f: impl FnOnce(&mut AllocationTracker) -> R) -> R {
    with_flag(&IS_THREAD_IN_ALLOCATION_TRACKER, || {
        f(&mut ALLOCATION_TRACKER.lock())
    })
}

pub(crate) fn intern_site(site: Site) -> SiteId {
    with_tracker(|tracker| tracker.intern(site))
}

/// Open a new capture window and copy the statistics of every site seen so far.
pub(crate) fn capture_sites() -> (u64, Vec<SiteStatistics>) {
    with_tracker(|tracker| {
        let generation = tracker.next_generation();
        (generation, tracker.sites().to_vec())
    })
}

// ----------------------------------------------------------------------------

const MAX_TOP_SITES: usize = 128;

#[derive(Clone, Debug)]
pub struct TrackingStatistics {
    /// How many live allocations are we tracking?
    pub tracked_allocs: usize,

    /// How many live bytes are we tracking?
    pub tracked_bytes: usize,

    /// How many live allocations are we NOT tracking (because they are too small)?
    pub untracked_allocs: usize,

    /// How many live bytes are we NOT tracking (because they are too small)?
    pub untracked_bytes: usize,

    /// Cumulative number of allocations done for internal book-keeping.
    pub tracker_allocs: usize,

    /// Cumulative number of bytes allocated for internal book-keeping.
    pub tracker_bytes: usize,

    /// Allocations smaller than these are left untracked.
    pub track_size_threshold: usize,

    /// The sites holding the most memory right now.
    pub top_sites: Vec<SiteStatistics>,
}

/// Gather statistics from the live tracking, if enabled.
///
/// Enable this with [`set_tracking_sites`].
pub fn tracking_stats(max_sites: usize) -> Option<TrackingStatistics> {
    is_tracking_sites().then(|| {
        with_tracker(|tracker| {
            let (tracked_allocs, tracked_bytes) = tracker.tracked_allocs_and_bytes();
            let top_sites = tracker
                .top_sites(max_sites.min(MAX_TOP_SITES))
                .into_iter()
                .cloned()
                .collect();

            TrackingStatistics {
                tracked_allocs,
                tracked_bytes,
                untracked_allocs: GLOBAL_STATS.untracked_allocs.load(Relaxed),
                untracked_bytes: GLOBAL_STATS.untracked_bytes.load(Relaxed),
                tracker_allocs: GLOBAL_STATS.tracker_allocs.load(Relaxed),
                tracker_bytes: GLOBAL_STATS.tracker_bytes.load(Relaxed),
                track_size_threshold: TRACK_MINIMUM,
                top_sites,
            }
        })
    })
}

// ----------------------------------------------------------------------------

/// Install this as the global allocator to get per-site memory tracking.
///
/// Usage:
/// ```
/// use mt_memory::TrackingAllocator;
///
/// #[global_allocator]
/// static GLOBAL: TrackingAllocator<std::alloc::System> = TrackingAllocator::new(std::alloc::System);
/// ```
#[derive(Default)]
pub struct TrackingAllocator<InnerAllocator> {
    allocator: InnerAllocator,
}

impl<InnerAllocator> TrackingAllocator<InnerAllocator> {
    pub const fn new(allocator: InnerAllocator) -> Self {
        Self { allocator }
    }
}

fn note_alloc(ptr: *mut u8, size: usize) {
    if ptr.is_null() {
        return;
    }

    if !GLOBAL_STATS.installed.load(Relaxed) {
        GLOBAL_STATS.installed.store(true, Relaxed);
    }

    GLOBAL_STATS.live_allocs.fetch_add(1, Relaxed);
    GLOBAL_STATS.live_bytes.fetch_add(size, Relaxed);

    if !GLOBAL_STATS.track_sites.load(Relaxed) {
        return;
    }

    if size < TRACK_MINIMUM {
        // Too small to track.
        GLOBAL_STATS.untracked_allocs.fetch_add(1, Relaxed);
        GLOBAL_STATS.untracked_bytes.fetch_add(size, Relaxed);
    } else if is_thread_in_allocation_tracker() || is_thread_untracked() {
        // This is the tracker (or someone hiding from it) allocating memory.
        GLOBAL_STATS.tracker_allocs.fetch_add(1, Relaxed);
        GLOBAL_STATS.tracker_bytes.fetch_add(size, Relaxed);
    } else {
        // Big enough to track - but make sure we don't create a deadlock by trying to
        // track the allocations made by the allocation tracker:
        let site = current_site();
        with_tracker(|tracker| tracker.on_alloc(site, ptr as usize, size));
        GLOBAL_STATS.site_allocs.fetch_add(1, Relaxed);
    }
}

fn note_dealloc(ptr: *mut u8, size: usize) {
    GLOBAL_STATS.live_allocs.fetch_sub(1, Relaxed);
    GLOBAL_STATS.live_bytes.fetch_sub(size, Relaxed);

    if size < TRACK_MINIMUM {
        if GLOBAL_STATS.track_sites.load(Relaxed) {
            // May have been allocated before tracking was switched on.
            saturating_sub(&GLOBAL_STATS.untracked_allocs, 1);
            saturating_sub(&GLOBAL_STATS.untracked_bytes, size);
        }
    } else if GLOBAL_STATS.site_allocs.load(Relaxed) > 0 && !is_thread_in_allocation_tracker() {
        if with_tracker(|tracker| tracker.on_dealloc(ptr as usize)) {
            GLOBAL_STATS.site_allocs.fetch_sub(1, Relaxed);
        }
    }
    // else: nothing tracked, or the tracker freeing its own book-keeping.
}

fn saturating_sub(counter: &AtomicUsize, amount: usize) {
    counter
        .fetch_update(Relaxed, Relaxed, |value| Some(value.saturating_sub(amount)))
        .ok();
}

#[expect(unsafe_code)]
// SAFETY:
// We just do book-keeping and then let another allocator do all the actual work.
unsafe impl<InnerAllocator: std::alloc::GlobalAlloc> std::alloc::GlobalAlloc
    for TrackingAllocator<InnerAllocator>
{
    unsafe fn alloc(&self, layout: std::alloc::Layout) -> *mut u8 {
        // SAFETY:
        // Just deferring
        let ptr = unsafe { self.allocator.alloc(layout) };
        note_alloc(ptr, layout.size());
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: std::alloc::Layout) -> *mut u8 {
        // SAFETY:
        // Just deferring
        let ptr = unsafe { self.allocator.alloc_zeroed(layout) };
        note_alloc(ptr, layout.size());
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: std::alloc::Layout) {
        // SAFETY:
        // Just deferring
        unsafe { self.allocator.dealloc(ptr, layout) };
        note_dealloc(ptr, layout.size());
    }

    unsafe fn realloc(
        &self,
        old_ptr: *mut u8,
        layout: std::alloc::Layout,
        new_size: usize,
    ) -> *mut u8 {
        // SAFETY:
        // Just deferring
        let new_ptr = unsafe { self.allocator.realloc(old_ptr, layout, new_size) };
        if !new_ptr.is_null() {
            note_dealloc(old_ptr, layout.size());
            note_alloc(new_ptr, new_size);
        }
        new_ptr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untracked_restores_flag() {
        assert!(!is_thread_untracked());
        untracked(|| {
            assert!(is_thread_untracked());
            untracked(|| assert!(is_thread_untracked()));
            assert!(is_thread_untracked());
        });
        assert!(!is_thread_untracked());
        assert!(!is_thread_in_allocation_tracker());
    }

    #[test]
    fn test_with_tracker_sets_flag() {
        with_tracker(|_| assert!(is_thread_in_allocation_tracker()));
        assert!(!is_thread_in_allocation_tracker());
    }

    #[test]
    fn test_saturating_sub_stops_at_zero() {
        let counter = AtomicUsize::new(3);
        saturating_sub(&counter, 2);
        assert_eq!(counter.load(Relaxed), 1);
        saturating_sub(&counter, 200);
        assert_eq!(counter.load(Relaxed), 0);
        saturating_sub(&counter, 1);
        assert_eq!(counter.load(Relaxed), 0);
    }

    #[test]
    fn test_not_installed_in_unit_tests() {
        // The unit-test binary uses the system allocator directly.
        assert!(!is_installed());
        assert_eq!(global_allocs_and_bytes(), (0, 0));
    }
}
