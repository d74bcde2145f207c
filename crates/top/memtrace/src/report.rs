//! The structured report written after a run.

use std::io::Write as _;
use std::path::Path;

use crate::aggregator::{FunctionRecord, RecordStore};
use crate::event::Arguments;

/// File name used when nothing else is configured.
pub const DEFAULT_FILE_NAME: &str = "profile_output.json";

#[derive(thiserror::Error, Debug)]
pub enum ReportError {
    #[error("failed to write report to {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// One function in the report.
///
/// Every field is always present, `null` and `[]` included, so that consumers can rely
/// on a fixed schema when diffing reports over time.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReportEntry {
    pub function: String,
    pub file: String,
    pub line: u32,
    pub max_time_ms: f64,
    pub cpu_time_ms: f64,
    pub max_mem_kb: f64,
    pub mem_growth_rss_kb: f64,
    pub args: Arguments,
    pub returned_size: u64,
    pub possible_memory_leak: Option<bool>,
    pub note: Vec<String>,
}

impl From<&FunctionRecord> for ReportEntry {
    fn from(record: &FunctionRecord) -> Self {
        Self {
            function: record.key.function.to_string(),
            file: record.key.file.to_string(),
            line: record.key.line,
            max_time_ms: record.max_time_ms(),
            cpu_time_ms: record.cpu_time_ms(),
            max_mem_kb: record.max_mem_kb(),
            mem_growth_rss_kb: record.mem_growth_rss_kb(),
            args: record.arguments.clone(),
            returned_size: record.returned_size,
            possible_memory_leak: record.possible_memory_leak,
            note: record.notes.clone(),
        }
    }
}

/// All functions of a run, in order of their first completed call.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Report {
    pub entries: Vec<ReportEntry>,
}

impl From<&RecordStore> for Report {
    fn from(store: &RecordStore) -> Self {
        Self {
            entries: store.iter().map(ReportEntry::from).collect(),
        }
    }
}

impl Report {
    pub fn to_json_string(&self) -> Result<String, ReportError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ReportError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn write_to_writer(&self, writer: impl std::io::Write) -> Result<(), ReportError> {
        Ok(serde_json::to_writer_pretty(writer, self)?)
    }

    /// Write the report to `path`, replacing whatever was there.
    ///
    /// The report is first written to a temporary file next to `path` and then moved
    /// into place, so `path` either holds the complete new report or is left untouched.
    pub fn write_to_path(&self, path: impl AsRef<Path>) -> Result<(), ReportError> {
        let path = path.as_ref();
        let io_error = |source| ReportError::Io {
            path: path.to_owned(),
            source,
        };

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut file = tempfile::NamedTempFile::new_in(dir).map_err(io_error)?;
        let mut writer = std::io::BufWriter::new(file.as_file_mut());
        self.write_to_writer(&mut writer)?;
        writer.flush().map_err(io_error)?;
        drop(writer);
        file.as_file().sync_all().map_err(io_error)?;
        file.persist(path).map_err(|err| io_error(err.error))?;

        mt_log::info!(
            "Wrote {} function record(s) to {}",
            self.entries.len(),
            path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::event::CodeLocation;

    fn entry(function: &str, leak: Option<bool>, note: Vec<String>) -> ReportEntry {
        ReportEntry {
            function: function.to_owned(),
            file: "src/app.rs".to_owned(),
            line: 12,
            max_time_ms: 12.5,
            cpu_time_ms: 3.125,
            max_mem_kb: 4882.813,
            mem_growth_rss_kb: -1.5,
            args: [("n".to_owned(), "10".to_owned())].into_iter().collect(),
            returned_size: 24,
            possible_memory_leak: leak,
            note,
        }
    }

    fn report() -> Report {
        Report {
            entries: vec![
                entry("app::quiet", None, vec![]),
                entry(
                    "app::leaky",
                    Some(true),
                    vec!["Obj return size is huge. Please check.".to_owned()],
                ),
            ],
        }
    }

    #[test]
    fn test_round_trip() {
        let report = report();
        let json = report.to_json_string().unwrap();
        similar_asserts::assert_eq!(Report::from_json(&json).unwrap(), report);
    }

    #[test]
    fn test_empty_fields_are_present() {
        let json = report().to_json_string().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        let quiet = &value[0];
        for field in [
            "function",
            "file",
            "line",
            "max_time_ms",
            "cpu_time_ms",
            "max_mem_kb",
            "mem_growth_rss_kb",
            "args",
            "returned_size",
            "possible_memory_leak",
            "note",
        ] {
            assert!(quiet.get(field).is_some(), "missing {field}");
        }
        assert!(quiet["possible_memory_leak"].is_null());
        assert_eq!(quiet["note"], serde_json::json!([]));
        assert_eq!(value[1]["possible_memory_leak"], serde_json::json!(true));
    }

    #[test]
    fn test_from_record() {
        let mut record_store = crate::aggregator::Aggregator::new(
            u64::MAX,
            crate::monitored_root::MonitoredRoot::new(env!("CARGO_MANIFEST_DIR")).unwrap(),
            false,
        );
        record_store.update(
            CodeLocation::new("app::work", "src/app.rs", 7),
            crate::aggregator::Measurement {
                wall_time: Duration::from_micros(1500),
                cpu_time: Duration::from_micros(250),
                peak_mem_delta: 2048,
                rss_growth: 4096,
                ..Default::default()
            },
        );

        let report = Report::from(record_store.records());
        assert_eq!(report.entries.len(), 1);
        let entry = &report.entries[0];
        assert_eq!(entry.function, "app::work");
        assert_eq!(entry.line, 7);
        assert_eq!(entry.max_time_ms, 1.5);
        assert_eq!(entry.cpu_time_ms, 0.25);
        assert_eq!(entry.max_mem_kb, 2.0);
        assert_eq!(entry.mem_growth_rss_kb, 4.0);
        assert_eq!(entry.possible_memory_leak, None);
    }

    #[test]
    fn test_write_to_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_FILE_NAME);

        std::fs::write(&path, "old").unwrap();
        report().write_to_path(&path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(Report::from_json(&written).unwrap(), report());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_write_to_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no").join("such").join(DEFAULT_FILE_NAME);
        let err = report().write_to_path(&path).unwrap_err();
        assert!(matches!(err, ReportError::Io { .. }));
        assert!(!path.exists());
    }
}
