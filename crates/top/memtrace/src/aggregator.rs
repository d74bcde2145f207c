//! Worst-case statistics per function.

use std::time::Duration;

use indexmap::{IndexMap, IndexSet};
use mt_memory::MemoryDiffEntry;

use crate::config::BYTES_PER_KB;
use crate::event::{Arguments, CodeLocation};
use crate::leak_classifier;
use crate::monitored_root::MonitoredRoot;

/// Note added when a function returns something larger than the leak threshold.
pub const HUGE_RETURN_NOTE: &str = "Obj return size is huge. Please check.";

/// Everything measured over one completed call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Measurement {
    pub wall_time: Duration,
    pub cpu_time: Duration,

    /// The largest growth of any single allocation site during the call.
    pub peak_mem_delta: u64,

    /// Change in process RSS from call to return.
    pub rss_growth: i64,

    pub arguments: Arguments,

    /// Size of the returned value, zero if nothing was returned.
    pub returned_size: u64,

    pub diff: Vec<MemoryDiffEntry>,
}

/// The aggregate of all completed calls of one function.
#[derive(Clone, Debug, PartialEq)]
pub struct FunctionRecord {
    pub key: CodeLocation,

    pub max_wall_time: Duration,
    pub max_cpu_time: Duration,
    pub max_mem_bytes: u64,

    /// From the most recent call.
    pub rss_growth_bytes: i64,

    /// From the most recent call.
    pub arguments: Arguments,

    /// From the most recent call.
    pub returned_size: u64,

    /// `None` until a leak candidate is seen, then `Some(true)` for good.
    pub possible_memory_leak: Option<bool>,

    pub notes: Vec<String>,
}

impl FunctionRecord {
    fn new(key: CodeLocation) -> Self {
        Self {
            key,
            max_wall_time: Duration::ZERO,
            max_cpu_time: Duration::ZERO,
            max_mem_bytes: 0,
            rss_growth_bytes: 0,
            arguments: Arguments::default(),
            returned_size: 0,
            possible_memory_leak: None,
            notes: Vec::new(),
        }
    }

    pub fn max_time_ms(&self) -> f64 {
        round3(self.max_wall_time.as_secs_f64() * 1000.0)
    }

    pub fn cpu_time_ms(&self) -> f64 {
        round3(self.max_cpu_time.as_secs_f64() * 1000.0)
    }

    pub fn max_mem_kb(&self) -> f64 {
        round3(self.max_mem_bytes as f64 / BYTES_PER_KB as f64)
    }

    pub fn mem_growth_rss_kb(&self) -> f64 {
        round3(self.rss_growth_bytes as f64 / BYTES_PER_KB as f64)
    }

    fn add_note(&mut self, note: String) {
        if !self.notes.contains(&note) {
            self.notes.push(note);
        }
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// All function records of a run, in order of first completion.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordStore {
    records: IndexMap<CodeLocation, FunctionRecord>,
    line_timing_candidates: IndexSet<CodeLocation>,
}

impl RecordStore {
    pub fn get(&self, key: &CodeLocation) -> Option<&FunctionRecord> {
        self.records.get(key)
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = &FunctionRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Functions to hand to a per-line timer, each listed once.
    pub fn line_timing_candidates(&self) -> impl ExactSizeIterator<Item = &CodeLocation> {
        self.line_timing_candidates.iter()
    }
}

/// Merges completed calls into the [`RecordStore`].
pub struct Aggregator {
    threshold_bytes: u64,
    root: MonitoredRoot,
    line_timing: bool,
    store: RecordStore,
}

impl Aggregator {
    pub fn new(threshold_bytes: u64, root: MonitoredRoot, line_timing: bool) -> Self {
        Self {
            threshold_bytes,
            root,
            line_timing,
            store: RecordStore::default(),
        }
    }

    /// Fold one completed call into the record for `key`.
    ///
    /// Times and memory are max-merged; RSS growth, arguments and returned size are
    /// overwritten. Notes are never duplicated, and a leak flag once set stays set.
    pub fn update(&mut self, key: CodeLocation, measurement: Measurement) -> &FunctionRecord {
        let Measurement {
            wall_time,
            cpu_time,
            peak_mem_delta,
            rss_growth,
            arguments,
            returned_size,
            diff,
        } = measurement;

        if self.line_timing {
            self.store.line_timing_candidates.insert(key.clone());
        }

        let record = self
            .store
            .records
            .entry(key)
            .or_insert_with_key(|key| FunctionRecord::new(key.clone()));

        record.max_wall_time = record.max_wall_time.max(wall_time);
        record.max_cpu_time = record.max_cpu_time.max(cpu_time);
        record.max_mem_bytes = record.max_mem_bytes.max(peak_mem_delta);
        record.rss_growth_bytes = rss_growth;
        record.arguments = arguments;
        record.returned_size = returned_size;

        if returned_size > self.threshold_bytes {
            record.add_note(HUGE_RETURN_NOTE.to_owned());
        }

        let candidates = leak_classifier::classify(&diff, self.threshold_bytes, &self.root);
        if !candidates.is_empty() {
            record.possible_memory_leak = Some(true);
            for candidate in &candidates {
                mt_log::debug!("[LEAK] {}: {}", record.key, candidate.note());
                record.add_note(candidate.note());
            }
        }

        record
    }

    pub fn records(&self) -> &RecordStore {
        &self.store
    }

    pub fn take_records(&mut self) -> RecordStore {
        std::mem::take(&mut self.store)
    }
}
