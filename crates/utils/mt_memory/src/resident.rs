/// How many bytes of this process are in physical memory, according to the OS.
///
/// Resident Set Size (RSS) on Linux, Android and Mac, Working Set on Windows.
/// This also covers memory that never went through [`crate::TrackingAllocator`].
#[cfg(not(target_arch = "wasm32"))]
pub fn bytes_resident() -> Option<i64> {
    let resident = memory_stats::memory_stats().map(|usage| usage.physical_mem as i64);
    if resident.is_none() {
        mt_log::warn_once!("Failed to query the resident memory of this process");
    }
    resident
}

#[cfg(target_arch = "wasm32")]
pub fn bytes_resident() -> Option<i64> {
    // blocked on https://github.com/Arc-blroth/memory-stats/issues/1
    None
}
