//! Run-time memory tracking.
//!
//! Install [`TrackingAllocator`] as the global allocator, enable tracking with
//! [`set_tracking_sites`], and every allocation of at least a few hundred bytes is
//! attributed to the source [`Site`] that is active on the allocating thread
//! (see [`SiteScope`] and [`site_scope!`]).
//!
//! [`Snapshot::capture`] then records how many bytes each site currently holds,
//! and [`Snapshot::diff`] tells you which sites grew or shrank in between.
//!
//! [`bytes_resident`] and [`PeakSampler`] complement this with what the operating system
//! thinks we use (RSS), which also covers memory that never went through our allocator.

mod allocation_tracker;
mod peak_history;
mod peak_sampler;
mod resident;
mod site;
mod snapshot;
mod tracking_allocator;

pub use {
    allocation_tracker::SiteStatistics,
    peak_history::PeakHistory,
    peak_sampler::PeakSampler,
    resident::bytes_resident,
    site::{Site, SiteScope},
    snapshot::{MemoryDiffEntry, SiteSample, Snapshot, SnapshotError},
    tracking_allocator::{
        TrackingAllocator, TrackingStatistics, global_allocs_and_bytes, is_installed,
        is_tracking_sites, set_tracking_sites, tracking_stats, untracked,
    },
};

/// Attribute allocations made by the current thread to the calling line,
/// until the returned [`SiteScope`] is dropped.
///
/// ```
/// let _site = mt_memory::site_scope!();
/// let buffer = vec![0_u8; 4096]; // attributed to the line above
/// # drop(buffer);
/// ```
#[macro_export]
macro_rules! site_scope {
    () => {
        $crate::SiteScope::enter($crate::Site::new(file!(), line!()))
    };
}
