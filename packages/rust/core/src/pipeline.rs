//! `ingest` pipeline: NDJSON records → DocumentStore → flush → summary.
//!
//! Each non-blank input line is one record
//! `{"kind": "Person", "id": "...", "document": {...}}`. Bad lines and failed
//! puts are counted and skipped; the run only fails on input I/O errors or
//! a failed flush.

use std::io::BufRead;
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use ldstore_shared::{LdStoreError, Result};
use ldstore_storage::{DocumentStore, StoreSummary};

/// One `(kind, id, document)` tuple emitted by a transformation branch.
#[derive(Debug, Clone, Deserialize)]
pub struct Record {
    pub kind: String,
    pub id: String,
    pub document: Value,
}

/// Result of an ingest run.
#[derive(Debug, Clone)]
pub struct IngestSummary {
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Non-blank lines read.
    pub lines: usize,
    /// 1-based line numbers that were not valid records.
    pub malformed_lines: Vec<usize>,
    /// Store counters after the final flush.
    pub store: StoreSummary,
    /// Total elapsed time.
    pub elapsed: Duration,
}

/// Progress callback for long-running batch work.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called after each document; `total` is 0 when unknown.
    fn document_done(&self, current: usize, total: usize);
    /// Called once with a one-line outcome.
    fn finished(&self, message: &str);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn document_done(&self, _current: usize, _total: usize) {}
    fn finished(&self, _message: &str) {}
}

/// Feed every record in `reader` to `store`, then flush it.
///
/// `source` is only used to label I/O errors (`-` for stdin).
#[instrument(skip_all, fields(source = %source.display()))]
pub fn ingest(
    reader: impl BufRead,
    source: &Path,
    store: &mut dyn DocumentStore,
    progress: &dyn ProgressReporter,
) -> Result<IngestSummary> {
    let started_at = Utc::now();
    let start = Instant::now();
    let mut lines = 0;
    let mut malformed_lines = Vec::new();

    progress.phase("Ingesting records");
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| LdStoreError::io(source, e))?;
        if line.trim().is_empty() {
            continue;
        }
        lines += 1;
        let line_no = index + 1;

        let record: Record = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!(line = line_no, error = %e, "skipping malformed record");
                malformed_lines.push(line_no);
                continue;
            }
        };

        // Failures are already recorded in the store summary.
        if let Err(e) = store.put(&record.kind, &record.id, record.document) {
            debug!(line = line_no, error = %e, "put failed");
        }
        progress.document_done(lines, 0);
    }

    progress.phase("Flushing");
    let store_summary = store.flush()?;

    let summary = IngestSummary {
        started_at,
        lines,
        malformed_lines,
        store: store_summary,
        elapsed: start.elapsed(),
    };

    progress.finished(&format!(
        "{} records, {} written, {} failed",
        summary.lines,
        summary.store.written(),
        summary.store.failed.len() + summary.malformed_lines.len()
    ));
    info!(
        lines = summary.lines,
        created = summary.store.created,
        merged = summary.store.merged,
        unchanged = summary.store.unchanged,
        conflicts = summary.store.conflicts,
        failed = summary.store.failed.len(),
        malformed = summary.malformed_lines.len(),
        elapsed_ms = summary.elapsed.as_millis(),
        "ingest complete"
    );

    Ok(summary)
}
