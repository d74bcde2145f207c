//! Text logging for the memtrace crates.
//!
//! This is a thin layer on top of the [`log`] facade, so that all crates log the same way.
//!
//! * `trace`: spammy things, like every ignored event
//! * `debug`: things that might be useful when debugging the tracer itself
//! * `info`: things the user wants to know about (e.g. "report written")
//! * `warn`: problems that cost us a measurement, but not the run
//! * `error`: problems that we cannot recover from
//!
//! The `*_once` variants only log the exact same message once per process,
//! which is what you want on a hot path that runs on every traced call.

mod result_extensions;
mod setup;

pub use log::{Level, LevelFilter, debug, error, info, log, trace, warn};

pub use log_once::{debug_once, error_once, info_once, log_once, trace_once, warn_once};

pub use result_extensions::ResultExt;
pub use setup::{default_log_filter, setup_logging};
