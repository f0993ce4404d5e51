//! Merging JSON-LD document store.
//!
//! Documents are addressed by `(kind, id)`, laid out on disk by
//! [`PartitionScheme`], and combined with whatever is already stored by
//! [`MergePolicy`]. Two interchangeable [`DocumentStore`] strategies exist:
//! - [`DiskStore`]: locked read-merge-write on every put, safe across processes
//! - [`MemoryStore`]: merges in memory, writes everything on [`DocumentStore::flush`]

pub mod disk;
pub mod fsio;
pub mod memory;
pub mod merge;
pub mod partition;

use serde_json::Value;

use ldstore_shared::{LdStoreError, Result, StoreConfig, Strategy};

pub use disk::{CommitOutcome, DiskStore, DocumentWriter};
pub use fsio::{DocumentLock, RetryPolicy};
pub use memory::MemoryStore;
pub use merge::{MergeConflict, MergePolicy};
pub use partition::{CorpusListing, PartitionScheme, UnreadableEntry};

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Accepts partial documents and converges them into one stored document per key.
pub trait DocumentStore {
    /// Merge `body` into whatever is stored under `(kind, id)`.
    fn put(&mut self, kind: &str, id: &str, body: Value) -> Result<()>;

    /// Parse `text` as JSON and [`put`](Self::put) it. A body that does not
    /// parse counts as a failed put.
    fn put_raw(&mut self, kind: &str, id: &str, text: &str) -> Result<()>;

    /// Read the document stored on disk under `(kind, id)`.
    fn get(&self, kind: &str, id: &str) -> Result<Option<Value>>;

    /// Persist anything buffered and return the run summary.
    fn flush(&mut self) -> Result<StoreSummary>;

    /// Counters accumulated so far.
    fn summary(&self) -> &StoreSummary;
}

/// Parse a raw document body.
pub(crate) fn parse_body(kind: &str, id: &str, text: &str) -> Result<Value> {
    serde_json::from_str(text).map_err(|e| {
        LdStoreError::malformed(format!("document for {kind}/{id} is not JSON: {e}"))
    })
}

/// Open the store strategy selected by configuration.
pub fn open_store(config: &StoreConfig, strategy: Strategy) -> Result<Box<dyn DocumentStore>> {
    Ok(match strategy {
        Strategy::Disk => Box::new(DiskStore::open(config)?),
        Strategy::Memory => Box::new(MemoryStore::open(config)?),
    })
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// What a commit did to the backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    /// No file existed; one was written.
    Created,
    /// Existing content changed.
    Merged,
    /// Merge produced the stored content again; nothing was written.
    Unchanged,
}

/// A key whose write failed, kept for re-running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedKey {
    pub key: String,
    pub error: String,
}

/// End-of-run counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSummary {
    /// Puts received.
    pub puts: usize,
    /// Documents written for the first time.
    pub created: usize,
    /// Documents whose stored content changed.
    pub merged: usize,
    /// Commits that left the stored document as it was.
    pub unchanged: usize,
    /// Scalar conflicts resolved in favour of the newer value.
    pub conflicts: usize,
    /// Keys that could not be written.
    pub failed: Vec<FailedKey>,
}

impl StoreSummary {
    pub(crate) fn record(&mut self, status: CommitStatus, conflicts: usize) {
        match status {
            CommitStatus::Created => self.created += 1,
            CommitStatus::Merged => self.merged += 1,
            CommitStatus::Unchanged => self.unchanged += 1,
        }
        self.conflicts += conflicts;
    }

    pub(crate) fn fail(&mut self, key: String, error: &LdStoreError) {
        tracing::warn!(%key, %error, "document write failed");
        self.failed.push(FailedKey {
            key,
            error: error.to_string(),
        });
    }

    /// Documents written (created or merged).
    pub fn written(&self) -> usize {
        self.created + self.merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strategies_converge_to_the_same_corpus() {
        let base = std::env::temp_dir().join(format!("ldstore-lib-{}", uuid::Uuid::now_v7()));
        let writes = [
            ("Person", "p1", json!({"name": "Smith"})),
            ("Person", "p1", json!({"identified_by": [{"id": "urn:n:1"}]})),
            ("Group", "g1", json!({"member_of": [{"id": "urn:g:0"}]})),
            ("Person", "p1", json!({"identified_by": [{"id": "urn:n:1"}, {"id": "urn:n:0"}]})),
        ];

        let mut results = Vec::new();
        for strategy in [Strategy::Disk, Strategy::Memory] {
            let root = base.join(format!("{strategy:?}"));
            let mut store = open_store(&StoreConfig::at(&root), strategy).unwrap();
            for (kind, id, body) in &writes {
                store.put(kind, id, body.clone()).unwrap();
            }
            let summary = store.flush().unwrap();
            assert!(summary.failed.is_empty());
            assert_eq!(summary.puts, writes.len());
            results.push((
                store.get("Person", "p1").unwrap(),
                store.get("Group", "g1").unwrap(),
            ));
        }
        assert_eq!(results[0], results[1]);
        assert_eq!(
            results[0].0.as_ref().unwrap()["identified_by"],
            json!([{"id": "urn:n:0"}, {"id": "urn:n:1"}])
        );

        let _ = std::fs::remove_dir_all(&base);
    }

    #[test]
    fn summary_counts_written() {
        let mut summary = StoreSummary::default();
        summary.record(CommitStatus::Created, 0);
        summary.record(CommitStatus::Merged, 2);
        summary.record(CommitStatus::Unchanged, 0);
        assert_eq!(summary.written(), 2);
        assert_eq!(summary.conflicts, 2);
    }
}
