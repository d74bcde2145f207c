//! Where the dispatcher gets memory snapshots from.

use std::time::Duration;

use mt_memory::{Snapshot, SnapshotError};

/// The memory side of the platform.
pub trait SnapshotSource: Send + Sync + 'static {
    /// Give unrelated background work a moment to finish freeing memory before a capture.
    fn settle(&self, delay: Duration) {
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }

    /// Record the current per-site allocation state.
    fn capture(&self) -> Result<Snapshot, SnapshotError>;

    /// Resident set size of the whole process, if the platform tells us.
    fn process_resident_bytes(&self) -> Option<i64>;
}

/// Snapshots from [`mt_memory::TrackingAllocator`], RSS from the operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllocatorSnapshots;

impl SnapshotSource for AllocatorSnapshots {
    fn capture(&self) -> Result<Snapshot, SnapshotError> {
        Snapshot::capture()
    }

    fn process_resident_bytes(&self) -> Option<i64> {
        mt_memory::bytes_resident()
    }
}

#[cfg(test)]
pub(crate) use fake::FakeSnapshots;
