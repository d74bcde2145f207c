//! Find out which of your functions take the most time and memory, and which look like they leak.
//!
//! ## How it works
//! A [`Dispatcher`] receives a call event when a function is entered and a return event
//! when it is left. On the call it takes a snapshot of how much memory every allocation
//! site holds and notes the time; on the return it does the same again, and folds the
//! difference into a [`FunctionRecord`] per function. Records keep the worst case over
//! all calls. A function is flagged as a possible leak when one call leaves behind at
//! least [`TracerConfig::leak_threshold_kb`] at a single site in your own code.
//!
//! Memory is measured with [`mt_memory::TrackingAllocator`], which has to be the global
//! allocator of the process:
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: mt_memory::TrackingAllocator<std::alloc::System> =
//!     mt_memory::TrackingAllocator::new(std::alloc::System);
//! ```
//!
//! ## Usage
//! Install a [`TraceSession`], mark the functions you care about with [`trace_call!`],
//! and write a [`Report`] when you are done:
//!
//! ```no_run
//! fn load(path: &str) -> Vec<u8> {
//!     let probe = memtrace::trace_call!(path);
//!     probe.finish(std::fs::read(path).unwrap_or_default())
//! }
//!
//! let session = memtrace::TraceSession::install(memtrace::TracerConfig::new(".").from_env()?)?;
//! load("Cargo.toml");
//! let records = session.finish();
//! memtrace::Report::from(&records).write_to_path(memtrace::DEFAULT_FILE_NAME)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Hosts with their own call interception (an interpreter, a plugin runtime, …) can skip
//! the probes and feed [`TraceEvent`]s to a [`Dispatcher`] directly, implementing
//! [`FrameIntrospect`] for their frames.

mod aggregator;
mod clock;
mod config;
mod dispatcher;
mod event;
mod leak_classifier;
mod ledger;
mod measure;
mod monitored_root;
mod probe;
mod report;
mod session;
mod snapshot_source;

pub use self::{
    aggregator::{Aggregator, FunctionRecord, HUGE_RETURN_NOTE, Measurement, RecordStore},
    clock::{Clock, RealClock},
    config::{BYTES_PER_KB, ConfigError, TracerConfig},
    dispatcher::{Dispatcher, Disposition},
    event::{ActivationId, Arguments, CodeLocation, EventKind, FrameIntrospect, TraceEvent},
    leak_classifier::{LeakCandidate, classify},
    ledger::{CallActivation, FrameLedger, LedgerError},
    measure::{CallOutcome, measure_call},
    monitored_root::{DenyList, MonitoredRoot},
    probe::CallProbe,
    report::{DEFAULT_FILE_NAME, Report, ReportEntry, ReportError},
    session::{InstallError, TraceSession, is_tracing},
    snapshot_source::{AllocatorSnapshots, SnapshotSource},
};

#[doc(hidden)]
pub use self::probe::clean_function_name as __clean_function_name;

// Re-exported so that users do not need to depend on these crates directly.
pub use mt_byte_size::SizeBytes;
pub use mt_memory::{MemoryDiffEntry, Site, Snapshot, SnapshotError};
