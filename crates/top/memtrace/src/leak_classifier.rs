//! Which allocation sites look like they leak.

use mt_memory::{MemoryDiffEntry, Site};

use crate::config::BYTES_PER_KB;
use crate::monitored_root::MonitoredRoot;

/// An allocation site in user code that retained at least the threshold in a single call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeakCandidate {
    pub site: Site,

    /// Bytes retained by the site over the call.
    pub retained_bytes: u64,
}

impl LeakCandidate {
    /// The note recorded on the function's record.
    pub fn note(&self) -> String {
        format!(
            "Possible memory leak: {:.3} KB retained at {}",
            self.retained_bytes as f64 / BYTES_PER_KB as f64,
            self.site
        )
    }
}

/// Pick out the leak candidates of one call's allocation diff.
///
/// A site qualifies when it grew by at least `threshold_bytes` and lies under `root`.
/// There is no correlation across calls: one large retention is enough.
pub fn classify(
    diff: &[MemoryDiffEntry],
    threshold_bytes: u64,
    root: &MonitoredRoot,
) -> Vec<LeakCandidate> {
    diff.iter()
        .filter_map(|entry| {
            let retained_bytes = u64::try_from(entry.size_diff).ok()?;
            (retained_bytes > 0
                && retained_bytes >= threshold_bytes
                && root.contains(entry.site.file()))
            .then(|| LeakCandidate {
                site: entry.site.clone(),
                retained_bytes,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(file: &str, size_diff: i64) -> MemoryDiffEntry {
        let start_size = 1_000_000;
        let size = (start_size as i64 + size_diff) as u64;
        MemoryDiffEntry {
            site: Site::new(file, 12),
            size_diff,
            size,
            start_size,
            peak_bytes: size.max(start_size),
        }
    }

    #[test]
    fn test_threshold_and_root() {
        let dir = tempfile::tempdir().unwrap();
        let inside = dir.path().join("app.rs");
        std::fs::write(&inside, "").unwrap();
        let inside = inside.to_str().unwrap();
        let root = MonitoredRoot::new(dir.path()).unwrap();

        let threshold = 3000 * 1024;
        let diff = [
            entry(inside, threshold as i64 - 1),
            entry(inside, threshold as i64),
            entry(inside, threshold as i64 + 1),
            entry(inside, -(threshold as i64) * 2),
            entry("/usr/lib/rustlib/src/alloc/vec.rs", threshold as i64 * 4),
            entry("<unattributed>", threshold as i64 * 4),
        ];

        let candidates = classify(&diff, threshold, &root);
        let retained: Vec<u64> = candidates.iter().map(|c| c.retained_bytes).collect();
        assert_eq!(retained, vec![threshold, threshold + 1]);
    }

    #[test]
    fn test_zero_threshold_needs_growth() {
        let dir = tempfile::tempdir().unwrap();
        let inside = dir.path().join("app.rs");
        std::fs::write(&inside, "").unwrap();
        let root = MonitoredRoot::new(dir.path()).unwrap();

        let diff = [entry(inside.to_str().unwrap(), 0)];
        assert!(classify(&diff, 0, &root).is_empty());
    }

    #[test]
    fn test_note() {
        let candidate = LeakCandidate {
            site: Site::new("src/cache.rs", 40),
            retained_bytes: 5 * 1024 * 1024,
        };
        assert_eq!(
            candidate.note(),
            "Possible memory leak: 5120.000 KB retained at src/cache.rs:40"
        );
    }
}
