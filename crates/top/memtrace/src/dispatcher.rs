//! Turns call and return events into measurements.

use std::time::Duration;

use mt_log::ResultExt as _;
use parking_lot::Mutex;

use crate::aggregator::{Aggregator, Measurement, RecordStore};
use crate::clock::{Clock, RealClock};
use crate::config::{ConfigError, TracerConfig};
use crate::event::{CodeLocation, EventKind, TraceEvent};
use crate::ledger::{CallActivation, FrameLedger};
use crate::monitored_root::{DenyList, MonitoredRoot};
use crate::snapshot_source::{AllocatorSnapshots, SnapshotSource};

const CPU_TIME_FAILED: &str = "Failed to read process CPU time";

/// What [`Dispatcher::dispatch`] did with an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Not a call or return. Nothing happened.
    PassedThrough,

    /// Outside the monitored root, or denied. Nothing happened.
    Filtered,

    /// A call whose start state is now in the ledger.
    Began,

    /// A call for an activation that is already in the ledger. Nothing happened.
    Untracked,

    /// A return that was folded into its function's record.
    Aggregated,

    /// A return whose call was never seen. Nothing happened.
    Unmatched,

    /// Measuring failed; this call will not be part of the results.
    Failed,
}

/// The hook invoked on every call and return.
///
/// Never panics and never returns an error: anything that goes wrong degrades to
/// [`Disposition::Failed`] for that one call.
pub struct Dispatcher {
    config: TracerConfig,
    root: MonitoredRoot,
    deny_list: DenyList,
    ledger: FrameLedger,
    aggregator: Mutex<Aggregator>,
    snapshots: Box<dyn SnapshotSource>,
    clock: Box<dyn Clock>,
}

impl Dispatcher {
    /// A dispatcher that measures with [`mt_memory`] and the operating system's clocks.
    pub fn new(config: TracerConfig) -> Result<Self, ConfigError> {
        Self::with_platform(config, AllocatorSnapshots, RealClock::default())
    }

    pub fn with_platform(
        config: TracerConfig,
        snapshots: impl SnapshotSource,
        clock: impl Clock,
    ) -> Result<Self, ConfigError> {
        let root = MonitoredRoot::new(&config.monitored_root)?;
        let deny_list = DenyList::new(config.deny_list.iter().cloned());
        let aggregator = Aggregator::new(
            config.leak_threshold_bytes(),
            root.clone(),
            config.line_timing,
        );

        Ok(Self {
            config,
            root,
            deny_list,
            ledger: FrameLedger::default(),
            aggregator: Mutex::new(aggregator),
            snapshots: Box::new(snapshots),
            clock: Box::new(clock),
        })
    }

    pub fn config(&self) -> &TracerConfig {
        &self.config
    }

    pub fn root(&self) -> &MonitoredRoot {
        &self.root
    }

    /// Would calls of this function be measured?
    pub fn is_traced(&self, location: &CodeLocation) -> bool {
        !self.deny_list.is_denied(&location.function) && self.root.contains(&location.file)
    }

    pub fn dispatch(&self, event: &TraceEvent<'_>) -> Disposition {
        match event.kind {
            EventKind::Call | EventKind::Return => {}
            EventKind::ExceptionReturn | EventKind::Line | EventKind::Other => {
                return Disposition::PassedThrough;
            }
        }

        // Our own book-keeping must not show up as allocations of the code being traced.
        mt_memory::untracked(|| {
            let location = event.frame.current_location();
            if !self.is_traced(&location) {
                return Disposition::Filtered;
            }

            if event.kind == EventKind::Call {
                self.on_call(event, &location)
            } else {
                self.on_return(event, location)
            }
        })
    }

    fn on_call(&self, event: &TraceEvent<'_>, location: &CodeLocation) -> Disposition {
        self.snapshots.settle(self.config.call_settle_delay);

        let Some(snapshot) = self.snapshots.capture().warn_on_err_once("Not measuring calls")
        else {
            return Disposition::Failed;
        };
        let rss_start = self.snapshots.process_resident_bytes();
        let arguments = event.frame.current_arguments();

        let wall_start = self.clock.wall_time();
        let Some(cpu_start) = self.clock.cpu_time().warn_on_err_once(CPU_TIME_FAILED) else {
            return Disposition::Failed;
        };

        let start = CallActivation {
            wall_start,
            cpu_start,
            snapshot,
            rss_start,
            arguments,
        };

        match self.ledger.begin(event.activation, start) {
            Ok(()) => {
                mt_log::debug!("[CALL] {location} {}", event.activation);
                Disposition::Began
            }
            Err(err) => {
                mt_log::debug!("Ignoring call of {location}: {err}");
                Disposition::Untracked
            }
        }
    }

    fn on_return(&self, event: &TraceEvent<'_>, location: CodeLocation) -> Disposition {
        let Some(start) = self.ledger.end(event.activation) else {
            mt_log::trace!("Return from {location} {} without a call", event.activation);
            return Disposition::Unmatched;
        };

        let wall_end = self.clock.wall_time();
        let cpu_end = self.clock.cpu_time();
        let returned_size = event
            .returned
            .map_or(0, |returned| returned.total_size_bytes());

        self.snapshots.settle(self.config.return_settle_delay);

        let Some(snapshot) = self.snapshots.capture().warn_on_err_once("Not measuring returns")
        else {
            return Disposition::Failed;
        };
        let rss_end = self.snapshots.process_resident_bytes();

        let Some(cpu_end) = cpu_end.warn_on_err_once(CPU_TIME_FAILED) else {
            return Disposition::Failed;
        };

        let diff = start.snapshot.diff(&snapshot);
        let measurement = Measurement {
            wall_time: elapsed(start.wall_start, wall_end, "wall"),
            cpu_time: elapsed(start.cpu_start, cpu_end, "CPU"),
            peak_mem_delta: diff.iter().map(|entry| entry.peak_delta()).max().unwrap_or(0),
            rss_growth: match (start.rss_start, rss_end) {
                (Some(start), Some(end)) => end - start,
                _ => 0,
            },
            arguments: start.arguments,
            returned_size,
            diff,
        };

        mt_log::debug!(
            "[RETURN] {location} {}: {:?} wall, {:?} CPU, {} B peak",
            event.activation,
            measurement.wall_time,
            measurement.cpu_time,
            measurement.peak_mem_delta
        );

        self.aggregator.lock().update(location, measurement);
        Disposition::Aggregated
    }

    /// Number of activations that have been called but not yet returned.
    pub fn active_activations(&self) -> usize {
        self.ledger.len()
    }

    /// Forget every activation that never returned. Returns how many there were.
    pub fn expire_abandoned(&self) -> usize {
        let abandoned = self.ledger.expire_all();
        if abandoned > 0 {
            mt_log::debug!("{abandoned} call(s) never returned and were not measured");
        }
        abandoned
    }

    /// A copy of the records so far.
    pub fn records(&self) -> RecordStore {
        self.aggregator.lock().records().clone()
    }

    /// Take the records so far, leaving an empty store behind.
    pub fn take_records(&self) -> RecordStore {
        self.aggregator.lock().take_records()
    }
}

/// `end - start`, clamped to zero if the clock went backwards.
fn elapsed(start: Duration, end: Duration, clock: &str) -> Duration {
    end.checked_sub(start).unwrap_or_else(|| {
        mt_log::debug!("{clock} clock went backwards by {:?}", start.saturating_sub(end));
        Duration::ZERO
    })
}

#[cfg(test)]
mod tests {
    use mt_memory::SnapshotError;

    use super::*;
    use crate::clock::FakeClock;
    use crate::event::{ActivationId, Arguments, FrameIntrospect};
    use crate::snapshot_source::FakeSnapshots;

    struct Frame {
        location: CodeLocation,
        arguments: Arguments,
    }

    impl Frame {
        fn new(function: &'static str, file: String, line: u32, arg: &str) -> Self {
            Self {
                location: CodeLocation::new(function, file, line),
                arguments: [("arg".to_owned(), arg.to_owned())].into_iter().collect(),
            }
        }
    }

    impl FrameIntrospect for Frame {
        fn current_location(&self) -> CodeLocation {
            self.location.clone()
        }

        fn current_arguments(&self) -> Arguments {
            self.arguments.clone()
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        clock: FakeClock,
        snapshots: FakeSnapshots,
        dispatcher: Dispatcher,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(|config| config)
        }

        fn with_config(f: impl FnOnce(TracerConfig) -> TracerConfig) -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("app.rs"), "").unwrap();

            let clock = FakeClock::default();
            let snapshots = FakeSnapshots::default();
            let config = f(TracerConfig::new(dir.path()).with_leak_threshold_kb(3000));
            let dispatcher =
                Dispatcher::with_platform(config, snapshots.clone(), clock.clone()).unwrap();

            Self {
                dir,
                clock,
                snapshots,
                dispatcher,
            }
        }

        fn source(&self) -> String {
            self.dir.path().join("app.rs").to_str().unwrap().to_owned()
        }

        fn frame(&self, function: &'static str, arg: &str) -> Frame {
            Frame::new(function, self.source(), 3, arg)
        }

        fn call(&self, id: u64, frame: &Frame) -> Disposition {
            self.dispatcher
                .dispatch(&TraceEvent::call(ActivationId(id), frame))
        }

        fn ret(&self, id: u64, frame: &Frame) -> Disposition {
            self.dispatcher
                .dispatch(&TraceEvent::ret(ActivationId(id), frame, None))
        }
    }

    fn ms(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[test]
    fn test_max_fields_and_last_write() {
        let h = Harness::new();
        let durations = [(40, 4, 1), (120, 2, -3), (70, 9, 5)];

        for (i, (wall, cpu, rss_growth)) in durations.into_iter().enumerate() {
            let frame = h.frame("app::work", &i.to_string());
            h.snapshots.set_rss(Some(1_000_000));
            assert_eq!(h.call(i as u64, &frame), Disposition::Began);
            h.clock.advance(ms(wall), ms(cpu));
            h.snapshots.set_rss(Some(1_000_000 + rss_growth));
            assert_eq!(h.ret(i as u64, &frame), Disposition::Aggregated);
        }

        let records = h.dispatcher.records();
        assert_eq!(records.len(), 1);
        let record = records.iter().next().unwrap();
        assert_eq!(record.max_wall_time, ms(120));
        assert_eq!(record.max_cpu_time, ms(9));
        assert_eq!(record.rss_growth_bytes, 5);
        assert_eq!(record.arguments["arg"], "2");
        assert_eq!(h.dispatcher.active_activations(), 0);
    }

    #[test]
    fn test_unmatched_return_is_ignored() {
        let h = Harness::new();
        let frame = h.frame("app::work", "");
        assert_eq!(h.ret(99, &frame), Disposition::Unmatched);
        assert!(h.dispatcher.records().is_empty());
    }

    #[test]
    fn test_clock_skew_clamps_to_zero() {
        let h = Harness::new();
        let frame = h.frame("app::work", "");

        h.clock.set(ms(500), ms(500));
        h.call(1, &frame);
        h.clock.set(ms(100), ms(499));
        assert_eq!(h.ret(1, &frame), Disposition::Aggregated);

        let record = h.dispatcher.records().iter().next().unwrap().clone();
        assert_eq!(record.max_wall_time, Duration::ZERO);
        assert_eq!(record.max_cpu_time, Duration::ZERO);
        assert_eq!(record.max_time_ms(), 0.0);
    }

    #[test]
    fn test_recursion_gets_separate_activations() {
        let h = Harness::new();
        let outer = h.frame("app::fib", "3");
        let inner = h.frame("app::fib", "2");

        h.call(1, &outer);
        h.clock.advance(ms(5), ms(1));
        h.call(2, &inner);
        assert_eq!(h.dispatcher.active_activations(), 2);
        h.clock.advance(ms(10), ms(1));
        assert_eq!(h.ret(2, &inner), Disposition::Aggregated);
        h.clock.advance(ms(5), ms(1));
        assert_eq!(h.ret(1, &outer), Disposition::Aggregated);

        let records = h.dispatcher.records();
        assert_eq!(records.len(), 1);
        let record = records.iter().next().unwrap();
        assert_eq!(record.max_wall_time, ms(20), "outer call spans the inner one");
        assert_eq!(record.arguments["arg"], "3", "outer returned last");
    }

    #[test]
    fn test_filtering() {
        let h = Harness::new();

        let outside = Frame::new("lib::work", "/nowhere/lib.rs".to_owned(), 1, "");
        assert_eq!(h.call(1, &outside), Disposition::Filtered);
        assert_eq!(h.ret(1, &outside), Disposition::Filtered);

        let denied = h.frame("app::Thing::drop", "");
        assert_eq!(h.call(2, &denied), Disposition::Filtered);

        let frame = h.frame("app::work", "");
        for kind in [EventKind::Line, EventKind::Other, EventKind::ExceptionReturn] {
            let event = TraceEvent::other(kind, ActivationId(3), &frame);
            assert_eq!(h.dispatcher.dispatch(&event), Disposition::PassedThrough);
        }

        assert_eq!(h.snapshots.captures(), 0);
        assert!(h.dispatcher.records().is_empty());
        assert_eq!(h.dispatcher.active_activations(), 0);
    }

    #[test]
    fn test_duplicate_call_is_untracked() {
        let h = Harness::new();
        let frame = h.frame("app::work", "");
        assert_eq!(h.call(1, &frame), Disposition::Began);
        assert_eq!(h.call(1, &frame), Disposition::Untracked);
        assert_eq!(h.dispatcher.active_activations(), 1);
    }

    #[test]
    fn test_snapshot_failure_skips_only_that_call() {
        let h = Harness::new();
        let frame = h.frame("app::work", "");

        h.snapshots.fail_with(Some(SnapshotError::NotTracking));
        assert_eq!(h.call(1, &frame), Disposition::Failed);
        assert_eq!(h.ret(1, &frame), Disposition::Unmatched);

        h.call(2, &frame);
        assert_eq!(h.ret(2, &frame), Disposition::Failed);
        assert_eq!(h.dispatcher.active_activations(), 0);

        h.snapshots.fail_with(None);
        h.call(3, &frame);
        assert_eq!(h.ret(3, &frame), Disposition::Aggregated);
        assert_eq!(h.dispatcher.records().len(), 1);
    }

    #[test]
    fn test_memory_diff_and_leak() {
        let h = Harness::new();
        let source = h.source();
        let frame = h.frame("app::grow", "");

        h.snapshots.set_site(&source, 8, 1000);
        h.call(1, &frame);
        h.snapshots.set_site(&source, 8, 1000 + 5_000_000);
        h.ret(1, &frame);

        h.call(2, &frame);
        h.snapshots.set_site(&source, 8, 1000 + 5_000_000 + 10_240);
        h.ret(2, &frame);

        let records = h.dispatcher.records();
        let record = records.iter().next().unwrap();
        assert_eq!(record.max_mem_bytes, 5_000_000);
        assert_eq!(record.possible_memory_leak, Some(true));
        assert_eq!(record.notes.len(), 1);
    }

    #[test]
    fn test_peak_counts_released_memory() {
        let h = Harness::new();
        let source = h.source();
        let frame = h.frame("app::spike", "");

        h.snapshots.set_site(&source, 8, 0);
        h.call(1, &frame);
        h.snapshots.set_site(&source, 8, 4_000_000);
        h.snapshots.set_site(&source, 8, 0);
        h.ret(1, &frame);

        let record = h.dispatcher.records().iter().next().unwrap().clone();
        assert_eq!(record.max_mem_bytes, 4_000_000);
        assert_eq!(record.possible_memory_leak, None);
    }

    #[test]
    fn test_peak_below_earlier_high_water() {
        let h = Harness::new();
        let source = h.source();
        let frame = h.frame("app::work", "");

        h.call(1, &frame);
        h.snapshots.set_site(&source, 8, 3_000_000);
        h.ret(1, &frame);

        h.call(2, &frame);
        h.snapshots.set_site(&source, 8, 5_000_000);
        h.snapshots.set_site(&source, 8, 3_000_000);
        h.ret(2, &frame);

        h.snapshots.set_site(&source, 8, 0);
        h.call(3, &frame);
        h.snapshots.set_site(&source, 8, 4_000_000);
        h.snapshots.set_site(&source, 8, 0);
        h.ret(3, &frame);

        let record = h.dispatcher.records().iter().next().unwrap().clone();
        assert_eq!(record.max_mem_bytes, 4_000_000);
    }

    #[test]
    fn test_concurrent_threads() {
        const WORKERS: [&str; 4] = [
            "app::worker0",
            "app::worker1",
            "app::worker2",
            "app::worker3",
        ];
        const CALLS: u64 = 25;

        let h = Harness::new();

        std::thread::scope(|scope| {
            for (t, function) in WORKERS.into_iter().enumerate() {
                let h = &h;
                scope.spawn(move || {
                    let t = t as u64;
                    for i in 0..CALLS {
                        let id = t * 1000 + i;
                        let frame = h.frame(function, &i.to_string());
                        let shared = h.frame("app::shared", &t.to_string());

                        assert_eq!(h.call(id, &frame), Disposition::Began);
                        assert_eq!(h.call(id + 500, &shared), Disposition::Began);
                        h.clock.advance(ms(t + 1), ms(1));
                        assert_eq!(h.ret(id + 500, &shared), Disposition::Aggregated);
                        assert_eq!(h.ret(id, &frame), Disposition::Aggregated);
                    }
                });
            }
        });

        assert_eq!(h.dispatcher.active_activations(), 0);

        // Other threads advance the shared clock too, so durations are bounded, not exact.
        let total_wall = ms(CALLS * (1 + 2 + 3 + 4));
        let records = h.dispatcher.records();
        assert_eq!(records.len(), WORKERS.len() + 1);
        for (t, function) in WORKERS.into_iter().enumerate() {
            let record = records
                .iter()
                .find(|record| record.key.function == function)
                .unwrap();
            assert!(record.max_wall_time >= ms(t as u64 + 1), "{function}");
            assert!(record.max_wall_time <= total_wall, "{function}");
            assert!(record.max_cpu_time >= ms(1), "{function}");
            assert_eq!(record.arguments["arg"], (CALLS - 1).to_string());
        }

        let shared = records
            .iter()
            .find(|record| record.key.function == "app::shared")
            .unwrap();
        assert!(shared.max_wall_time >= ms(WORKERS.len() as u64));
        assert!(shared.max_wall_time <= total_wall);
    }

    #[test]
    fn test_settle_delays() {
        let h = Harness::with_config(|config| config.with_settle_delays(ms(200), ms(20)));
        let frame = h.frame("app::work", "");
        h.call(1, &frame);
        h.ret(1, &frame);
        assert_eq!(h.snapshots.settles(), vec![ms(200), ms(20)]);
    }

    #[test]
    fn test_returned_size() {
        let h = Harness::with_config(|config| config.with_leak_threshold_kb(1));
        let frame = h.frame("app::make", "");

        let big = vec![0_u8; 4096];
        h.call(1, &frame);
        let event = TraceEvent::ret(ActivationId(1), &frame, Some(&big));
        assert_eq!(h.dispatcher.dispatch(&event), Disposition::Aggregated);

        let record = h.dispatcher.records().iter().next().unwrap().clone();
        assert!(record.returned_size >= 4096);
        assert_eq!(
            record.notes,
            vec![crate::aggregator::HUGE_RETURN_NOTE.to_owned()]
        );
    }

    #[test]
    fn test_expire_abandoned() {
        let h = Harness::new();
        let frame = h.frame("app::hang", "");
        h.call(1, &frame);
        h.call(2, &frame);
        assert_eq!(h.dispatcher.expire_abandoned(), 2);
        assert_eq!(h.ret(1, &frame), Disposition::Unmatched);
        assert!(h.dispatcher.records().is_empty());
    }
}
