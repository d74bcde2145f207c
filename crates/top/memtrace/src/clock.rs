//! Time sources the dispatcher measures with.

use std::time::{Duration, Instant};

/// Where the dispatcher gets wall-clock and CPU time from.
///
/// Both are durations since some arbitrary, fixed origin. Only differences are meaningful.
pub trait Clock: Send + Sync + 'static {
    fn wall_time(&self) -> Duration;

    /// CPU time consumed by the whole process.
    fn cpu_time(&self) -> std::io::Result<Duration>;
}

/// The operating system's clocks.
#[derive(Clone, Copy, Debug)]
pub struct RealClock {
    origin: Instant,
}

impl Default for RealClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for RealClock {
    fn wall_time(&self) -> Duration {
        self.origin.elapsed()
    }

    fn cpu_time(&self) -> std::io::Result<Duration> {
        Ok(cpu_time::ProcessTime::try_now()?.as_duration())
    }
}

#[cfg(test)]
pub(crate) use fake::FakeClock;
