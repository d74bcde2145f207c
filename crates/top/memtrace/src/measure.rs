//! Measuring a single top-level invocation.

use std::time::Duration;

use mt_memory::PeakSampler;

/// What [`measure_call`] found out about one invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallOutcome<R> {
    /// Whatever the invocation returned.
    pub value: R,

    /// Highest process RSS seen while the invocation ran, if the platform reports RSS.
    pub peak_rss_bytes: Option<i64>,

    /// Process RSS just before the invocation.
    pub baseline_rss_bytes: Option<i64>,
}

impl<R> CallOutcome<R> {
    /// How far above its starting point RSS went during the invocation.
    pub fn peak_growth_bytes(&self) -> Option<i64> {
        Some(self.peak_rss_bytes? - self.baseline_rss_bytes?)
    }
}

/// Run `f` while sampling process RSS every `interval` on a background thread.
///
/// Meant for wrapping one top-level invocation (a request handler, a job, …) to report
/// its own peak independently of the aggregated records.
/// If the sampler cannot be started, `f` still runs and the peak is just the end points.
pub fn measure_call<R>(interval: Duration, f: impl FnOnce() -> R) -> CallOutcome<R> {
    measure_call_with(interval, mt_memory::bytes_resident, f)
}

fn measure_call_with<R>(
    interval: Duration,
    read: impl Fn() -> Option<i64> + Clone + Send + 'static,
    f: impl FnOnce() -> R,
) -> CallOutcome<R> {
    let baseline_rss_bytes = read();

    let sampler = match PeakSampler::start_with(interval, read.clone()) {
        Ok(sampler) => Some(sampler),
        Err(err) => {
            mt_log::warn_once!("Failed to start peak sampler: {err}");
            None
        }
    };

    let value = f();

    let sampled_peak = sampler.and_then(PeakSampler::stop);
    let peak_rss_bytes = [baseline_rss_bytes, sampled_peak, read()]
        .into_iter()
        .flatten()
        .max();

    CallOutcome {
        value,
        peak_rss_bytes,
        baseline_rss_bytes,
    }
}
