use std::collections::BTreeMap;

use crate::peak_history::PeakHistory;
use crate::site::Site;

/// Why a [`Snapshot`] could not be taken.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("mt_memory::TrackingAllocator is not installed as the global allocator")]
    NotInstalled,

    #[error("allocation site tracking is disabled (see mt_memory::set_tracking_sites)")]
    NotTracking,
}

/// What one site held at the moment of a [`Snapshot`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SiteSample {
    /// Live bytes at this site.
    pub extant_bytes: u64,

    /// The most live bytes this site has ever held at once.
    pub high_water_bytes: u64,

    /// Peaks of earlier capture windows, up to this snapshot.
    pub peaks: PeakHistory,
}

/// A point-in-time record of how many bytes each [`Site`] holds.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// The capture window this snapshot opened.
    generation: u64,

    sites: BTreeMap<Site, SiteSample>,
}

impl Snapshot {
    /// Record the current per-site allocation state.
    ///
    /// Costs a copy of the site table, so it grows with the number of distinct sites.
    pub fn capture() -> Result<Self, SnapshotError> {
        if !crate::is_installed() {
            return Err(SnapshotError::NotInstalled);
        }
        if !crate::is_tracking_sites() {
            return Err(SnapshotError::NotTracking);
        }

        let (generation, statistics) = crate::tracking_allocator::capture_sites();
        Ok(crate::untracked(|| {
            let sites = statistics.into_iter().map(|stats| {
                (
                    stats.site,
                    SiteSample {
                        extant_bytes: stats.extant_bytes as u64,
                        high_water_bytes: stats.high_water_bytes as u64,
                        peaks: stats.peaks,
                    },
                )
            });
            Self::from_sites(generation, sites)
        }))
    }

    /// A snapshot that opened capture window `generation`.
    pub fn from_sites(
        generation: u64,
        sites: impl IntoIterator<Item = (Site, SiteSample)>,
    ) -> Self {
        Self {
            generation,
            sites: sites.into_iter().collect(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn get(&self, site: &Site) -> Option<&SiteSample> {
        self.sites.get(site)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Site, &SiteSample)> {
        self.sites.iter()
    }

    /// Total live bytes over all sites.
    pub fn total_bytes(&self) -> u64 {
        self.sites.values().map(|sample| sample.extant_bytes).sum()
    }

    /// Every site whose live bytes changed between `self` and `later`,
    /// or that peaked above its starting point in between.
    ///
    /// Sites only present in one of the snapshots count as holding zero bytes in the other.
    /// The entries are ordered by site, so identical inputs give identical outputs.
    pub fn diff(&self, later: &Self) -> Vec<MemoryDiffEntry> {
        let empty = SiteSample::default();

        let mut sites: Vec<&Site> = later.sites.keys().collect();
        sites.extend(self.sites.keys().filter(|site| !later.sites.contains_key(*site)));
        sites.sort();

        sites
            .into_iter()
            .filter_map(|site| {
                let before = self.sites.get(site).unwrap_or(&empty);
                let after = later.sites.get(site).unwrap_or(&empty);

                let size_diff = after.extant_bytes as i64 - before.extant_bytes as i64;
                let peak_bytes = after
                    .peaks
                    .peak_since(self.generation)
                    .unwrap_or_default()
                    .max(before.extant_bytes)
                    .max(after.extant_bytes);
                if size_diff == 0 && peak_bytes == before.extant_bytes {
                    return None;
                }

                Some(MemoryDiffEntry {
                    site: site.clone(),
                    size_diff,
                    size: after.extant_bytes,
                    start_size: before.extant_bytes,
                    peak_bytes,
                })
            })
            .collect()
    }
}

// ----------------------------------------------------------------------------

/// How one site changed between two [`Snapshot`]s.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryDiffEntry {
    pub site: Site,

    /// Signed change in live bytes.
    pub size_diff: i64,

    /// Live bytes in the later snapshot.
    pub size: u64,

    /// Live bytes in the earlier snapshot.
    pub start_size: u64,

    /// Peak live bytes at this site between the two snapshots.
    pub peak_bytes: u64,
}

impl MemoryDiffEntry {
    /// How far above its starting point the site peaked.
    pub fn peak_delta(&self) -> u64 {
        self.peak_bytes.saturating_sub(self.start_size)
    }
}
