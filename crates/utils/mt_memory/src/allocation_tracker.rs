use crate::peak_history::PeakHistory;
use crate::site::{Site, SiteId};

// ----------------------------------------------------------------------------

/// Per-site statistics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SiteStatistics {
    /// Where the allocations were made.
    pub site: Site,

    /// Number of live allocations at this site.
    pub extant_count: usize,

    /// The number of live bytes currently allocated at this site.
    pub extant_bytes: usize,

    /// The most live bytes this site has ever held at once.
    pub high_water_bytes: usize,

    /// The peak live bytes since each recent capture generation.
    pub peaks: PeakHistory,
}

impl SiteStatistics {
    fn new(site: Site) -> Self {
        Self {
            site,
            extant_count: 0,
            extant_bytes: 0,
            high_water_bytes: 0,
            peaks: PeakHistory::default(),
        }
    }

    fn set_extant_bytes(&mut self, generation: u64, extant_bytes: usize) {
        self.peaks
            .record(generation, self.extant_bytes as u64, extant_bytes as u64);
        self.extant_bytes = extant_bytes;
        self.high_water_bytes = self.high_water_bytes.max(extant_bytes);
    }
}

// ----------------------------------------------------------------------------

/// Track which site each live allocation belongs to.
pub struct AllocationTracker {
    /// Interned sites. Index = [`SiteId`].
    sites: Vec<SiteStatistics>,

    /// Reverse lookup for interning.
    site_ids: ahash::HashMap<Site, SiteId>,

    /// Current live allocations. Key = pointer address.
    live_allocs: ahash::HashMap<usize, (SiteId, usize)>,

    /// Bumped by every capture, see [`PeakHistory`].
    generation: u64,
}

impl Default for AllocationTracker {
    fn default() -> Self {
        let unattributed = Site::unattributed();
        let mut site_ids = ahash::HashMap::default();
        site_ids.insert(unattributed.clone(), SiteId::UNATTRIBUTED);

        Self {
            sites: vec![SiteStatistics::new(unattributed)],
            site_ids,
            live_allocs: Default::default(),
            generation: 0,
        }
    }
}

impl AllocationTracker {
    pub fn intern(&mut self, site: Site) -> SiteId {
        if let Some(id) = self.site_ids.get(&site) {
            return *id;
        }

        let Ok(index) = u32::try_from(self.sites.len()) else {
            // Four billion distinct sites. Let's not.
            return SiteId::UNATTRIBUTED;
        };
        let id = SiteId(index);
        self.sites.push(SiteStatistics::new(site.clone()));
        self.site_ids.insert(site, id);
        id
    }

    pub fn on_alloc(&mut self, site: SiteId, ptr: usize, size: usize) {
        let site = if (site.0 as usize) < self.sites.len() {
            site
        } else {
            SiteId::UNATTRIBUTED
        };

        // A stale entry means the old allocation was freed while we were not looking.
        if let Some(stale) = self.live_allocs.insert(ptr, (site, size)) {
            self.forget(stale);
        }

        let generation = self.generation;
        let stats = &mut self.sites[site.0 as usize];
        stats.extant_count += 1;
        stats.set_extant_bytes(generation, stats.extant_bytes + size);
    }

    /// Returns `false` if the allocation was unknown to us,
    /// e.g. because it was made before tracking started, or by the tracker itself.
    pub fn on_dealloc(&mut self, ptr: usize) -> bool {
        match self.live_allocs.remove(&ptr) {
            Some(entry) => {
                self.forget(entry);
                true
            }
            None => false,
        }
    }

    fn forget(&mut self, (site, size): (SiteId, usize)) {
        let generation = self.generation;
        if let Some(stats) = self.sites.get_mut(site.0 as usize) {
            stats.extant_count = stats.extant_count.saturating_sub(1);
            stats.set_extant_bytes(generation, stats.extant_bytes.saturating_sub(size));
        }
    }

    /// Start a new capture window, returning its generation.
    ///
    /// Changes from now on are recorded under the returned generation.
    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Number of live allocations and bytes we are tracking.
    pub fn tracked_allocs_and_bytes(&self) -> (usize, usize) {
        (
            self.live_allocs.len(),
            self.sites.iter().map(|s| s.extant_bytes).sum(),
        )
    }

    /// Every site we have ever seen, in interning order.
    pub fn sites(&self) -> &[SiteStatistics] {
        &self.sites
    }

    /// Return the `n` sites that currently use the most memory.
    pub fn top_sites(&self, n: usize) -> Vec<&SiteStatistics> {
        let mut vec: Vec<_> = self.sites.iter().filter(|s| 0 < s.extant_bytes).collect();
        vec.sort_by_key(|stats| std::cmp::Reverse(stats.extant_bytes));
        vec.truncate(n);
        vec
    }
}
