use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

/// Sentinel for "no sample taken yet".
const NO_SAMPLE: i64 = i64::MIN;

struct Shared {
    peak: AtomicI64,
    keep_running: AtomicBool,
}

impl Shared {
    fn observe(&self, bytes: Option<i64>) {
        if let Some(bytes) = bytes {
            self.peak.fetch_max(bytes, Ordering::Relaxed);
        }
    }

    fn peak(&self) -> Option<i64> {
        let peak = self.peak.load(Ordering::Relaxed);
        (peak != NO_SAMPLE).then_some(peak)
    }
}

/// Samples a memory reading on a background thread at a fixed interval,
/// remembering the highest value seen.
///
/// This catches short-lived spikes that two readings before and after a call would miss.
/// The thread stops when the sampler is stopped or dropped.
pub struct PeakSampler {
    shared: Arc<Shared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl PeakSampler {
    /// Sample [`crate::bytes_resident`] every `interval`.
    pub fn start(interval: Duration) -> std::io::Result<Self> {
        Self::start_with(interval, crate::bytes_resident)
    }

    /// Sample `read` every `interval`.
    ///
    /// `read` is also called once up front, so there is always at least one sample
    /// (unless `read` returns `None`).
    pub fn start_with(
        interval: Duration,
        read: impl Fn() -> Option<i64> + Send + 'static,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            peak: AtomicI64::new(NO_SAMPLE),
            keep_running: AtomicBool::new(true),
        });
        shared.observe(read());

        let thread = std::thread::Builder::new()
            .name("mt_peak_sampler".to_owned())
            .spawn({
                let shared = shared.clone();
                move || {
                    while shared.keep_running.load(Ordering::Acquire) {
                        std::thread::park_timeout(interval);
                        shared.observe(read());
                    }
                }
            })?;

        mt_log::trace!("Started peak sampler with interval {interval:?}");

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// The highest reading so far, if any.
    pub fn observed_peak(&self) -> Option<i64> {
        self.shared.peak()
    }

    /// Stop sampling and return the highest reading.
    ///
    /// The background thread takes one last sample before it exits.
    pub fn stop(mut self) -> Option<i64> {
        self.join();
        self.shared.peak()
    }

    fn join(&mut self) {
        self.shared.keep_running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                mt_log::warn!("Peak sampler thread panicked");
            }
        }
    }
}

impl Drop for PeakSampler {
    fn drop(&mut self) {
        self.join();
    }
}

impl std::fmt::Debug for PeakSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeakSampler")
            .field("observed_peak", &self.observed_peak())
            .finish_non_exhaustive()
    }
}
