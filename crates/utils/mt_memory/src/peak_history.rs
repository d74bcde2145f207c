/// Keep at most this many windows per site.
///
/// When we run out, the two oldest windows are merged, which can only over-estimate
/// the peak seen by a very old capture.
const MAX_WINDOWS: usize = 64;

/// The peak live bytes of a single site, per capture generation.
///
/// Every [`crate::Snapshot`] bumps a global generation counter.
/// Changes to a site are recorded under the generation that was current when they happened,
/// so "the most this site held since capture `g`" is the max over all windows from `g` onwards.
///
/// Windows are kept with strictly decreasing peaks: an older window that peaked no higher
/// than a newer one answers no query the newer one doesn't, so it is dropped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeakHistory {
    windows: Vec<PeakWindow>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PeakWindow {
    generation: u64,
    peak: u64,
}

impl PeakHistory {
    /// The site went from `before` to `after` live bytes during `generation`.
    pub fn record(&mut self, generation: u64, before: u64, after: u64) {
        let same_generation = self
            .windows
            .last()
            .is_some_and(|last| last.generation == generation);
        if same_generation {
            if let Some(last) = self.windows.last_mut() {
                last.peak = last.peak.max(after);
            }
        } else {
            self.windows.push(PeakWindow {
                generation,
                peak: before.max(after),
            });
        }

        let current = self.windows.len() - 1;
        let peak = self.windows[current].peak;
        let mut first_dominated = current;
        while 0 < first_dominated && self.windows[first_dominated - 1].peak <= peak {
            first_dominated -= 1;
        }
        self.windows.drain(first_dominated..current);

        if MAX_WINDOWS < self.windows.len() {
            let oldest = self.windows.remove(0);
            self.windows[0].peak = self.windows[0].peak.max(oldest.peak);
        }
    }

    /// The most live bytes recorded at or after `generation`.
    ///
    /// `None` if the site did not change since then.
    pub fn peak_since(&self, generation: u64) -> Option<u64> {
        self.windows
            .iter()
            .rev()
            .take_while(|window| generation <= window.generation)
            .map(|window| window.peak)
            .max()
    }
}
