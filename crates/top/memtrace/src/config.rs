use std::path::PathBuf;
use std::time::Duration;

/// How many bytes in a "KB" everywhere in this crate.
pub const BYTES_PER_KB: u64 = 1024;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("monitored root {path:?} cannot be resolved: {source}")]
    InvalidRoot {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("environment variable {name}={value:?} is invalid: expected {expected}")]
    InvalidEnvVar {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Configures a tracer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TracerConfig {
    /// Only code under this directory is traced.
    ///
    /// Resolved to a canonical path once, when the tracer is created.
    pub monitored_root: PathBuf,

    /// Allocation sites that retain at least this much memory in one call are leak candidates.
    /// Returned values larger than this get a note too.
    pub leak_threshold_kb: u64,

    /// Pause before the snapshot taken at each call, to let unrelated background frees settle.
    pub call_settle_delay: Duration,

    /// Pause before the snapshot taken at each return.
    pub return_settle_delay: Duration,

    /// Register every traced function as a candidate for per-line timing.
    pub line_timing: bool,

    /// Functions that are never traced, regardless of where they are defined.
    ///
    /// An entry matches a function with exactly that name, with that last path segment
    /// (`drop` matches `my_crate::Buffer::drop`), or inside that module (`tokio` matches
    /// `tokio::runtime::block_on`).
    pub deny_list: Vec<String>,

    /// How often [`crate::measure_call`] samples resident memory.
    pub peak_sample_interval: Duration,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            monitored_root: PathBuf::from("."),
            leak_threshold_kb: 3000,
            call_settle_delay: Duration::from_millis(200),
            return_settle_delay: Duration::from_millis(20),
            line_timing: true,
            deny_list: default_deny_list(),
            peak_sample_interval: Duration::from_millis(10),
        }
    }
}

fn default_deny_list() -> Vec<String> {
    ["{{closure}}", "drop", "fmt", "clone", "core::", "std::", "alloc::"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

impl TracerConfig {
    pub fn new(monitored_root: impl Into<PathBuf>) -> Self {
        Self {
            monitored_root: monitored_root.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_leak_threshold_kb(mut self, leak_threshold_kb: u64) -> Self {
        self.leak_threshold_kb = leak_threshold_kb;
        self
    }

    #[must_use]
    pub fn with_settle_delays(mut self, call: Duration, ret: Duration) -> Self {
        self.call_settle_delay = call;
        self.return_settle_delay = ret;
        self
    }

    #[must_use]
    pub fn with_line_timing(mut self, line_timing: bool) -> Self {
        self.line_timing = line_timing;
        self
    }

    #[must_use]
    pub fn with_denied(mut self, function: impl Into<String>) -> Self {
        self.deny_list.push(function.into());
        self
    }

    #[must_use]
    pub fn with_peak_sample_interval(mut self, interval: Duration) -> Self {
        self.peak_sample_interval = interval;
        self
    }

    pub fn leak_threshold_bytes(&self) -> u64 {
        self.leak_threshold_kb.saturating_mul(BYTES_PER_KB)
    }

    /// Apply overrides from `MEMTRACE_*` environment variables.
    ///
    /// * `MEMTRACE_ROOT`: monitored root directory
    /// * `MEMTRACE_LEAK_THRESHOLD_KB`: leak threshold in KB
    /// * `MEMTRACE_CALL_SETTLE_MS`, `MEMTRACE_RETURN_SETTLE_MS`: settle delays in milliseconds
    /// * `MEMTRACE_LINE_TIMING`: `true`/`false` (or `1`/`0`)
    /// * `MEMTRACE_DENY`: comma-separated extra deny-list entries (see [`crate::DenyList`])
    pub fn from_env(mut self) -> Result<Self, ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(self)
    }

    fn apply_overrides(
        &mut self,
        var: impl Fn(&'static str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(root) = var("MEMTRACE_ROOT") {
            self.monitored_root = root.into();
        }
        if let Some(value) = var("MEMTRACE_LEAK_THRESHOLD_KB") {
            self.leak_threshold_kb = parse_u64("MEMTRACE_LEAK_THRESHOLD_KB", value)?;
        }
        if let Some(value) = var("MEMTRACE_CALL_SETTLE_MS") {
            self.call_settle_delay =
                Duration::from_millis(parse_u64("MEMTRACE_CALL_SETTLE_MS", value)?);
        }
        if let Some(value) = var("MEMTRACE_RETURN_SETTLE_MS") {
            self.return_settle_delay =
                Duration::from_millis(parse_u64("MEMTRACE_RETURN_SETTLE_MS", value)?);
        }
        if let Some(value) = var("MEMTRACE_LINE_TIMING") {
            self.line_timing = match value.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidEnvVar {
                        name: "MEMTRACE_LINE_TIMING",
                        value,
                        expected: "a boolean",
                    });
                }
            };
        }
        if let Some(value) = var("MEMTRACE_DENY") {
            self.deny_list.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|entry| !entry.is_empty())
                    .map(str::to_owned),
            );
        }
        Ok(())
    }
}

fn parse_u64(name: &'static str, value: String) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_err| ConfigError::InvalidEnvVar {
            name,
            value,
            expected: "a non-negative integer",
        })
}
