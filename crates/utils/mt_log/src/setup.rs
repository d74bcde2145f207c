//! Function to setup logging in binaries and tests.

use std::sync::atomic::{AtomicBool, Ordering};

/// Crates that are too loud at `debug` for anyone interested in what the tracer does.
const LOUD_CRATES: [&str; 2] = ["mio", "tempfile"];

/// `RUST_LOG` (or `info` if unset), with the loud crates turned down unless `RUST_LOG` mentions them.
pub fn default_log_filter() -> String {
    let mut filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_owned());

    for loud_crate in LOUD_CRATES {
        if !filter.contains(&format!("{loud_crate}=")) {
            filter += &format!(",{loud_crate}=warn");
        }
    }

    filter
}

/// Directs [`log`] calls to stderr, filtered by `RUST_LOG` (default `info`).
///
/// Calling this more than once is fine; only the first call installs a logger.
pub fn setup_logging() {
    static LOG_INIT: AtomicBool = AtomicBool::new(false);

    if LOG_INIT.swap(true, Ordering::SeqCst) {
        return;
    }

    let result = env_logger::Builder::new()
        .parse_filters(&default_log_filter())
        .format_timestamp_millis()
        .try_init();

    if let Err(err) = result {
        // Someone else (e.g. a test harness) already installed a logger. That's ok.
        log::debug!("Did not install env_logger: {err}");
    }
}

#[test]
fn test_default_filter_quiets_loud_crates() {
    let filter = default_log_filter();
    assert!(filter.contains("mio=warn"));
    assert!(filter.contains("tempfile=warn"));
}

#[test]
fn test_setup_twice() {
    setup_logging();
    setup_logging();
}
