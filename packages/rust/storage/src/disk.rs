//! Disk-synchronous document store.
//!
//! Every put runs lock → read → merge → atomic write → unlock against the
//! backing file, so independent processes can share one output directory.

use serde_json::Value;
use tracing::{debug, instrument, warn};

use ldstore_shared::{Format, Kind, LdStoreError, Result, StorageKey, StoreConfig};

use crate::fsio::{self, DocumentLock, RetryPolicy};
use crate::merge::{MergeConflict, MergePolicy};
use crate::partition::PartitionScheme;
use crate::{CommitStatus, DocumentStore, StoreSummary, parse_body};

// ---------------------------------------------------------------------------
// DocumentWriter
// ---------------------------------------------------------------------------

/// Result of merging one body into its backing file.
#[derive(Debug)]
pub struct CommitOutcome {
    pub status: CommitStatus,
    pub conflicts: Vec<MergeConflict>,
}

/// The locked read-merge-write cycle shared by both store strategies.
#[derive(Debug, Clone)]
pub struct DocumentWriter {
    scheme: PartitionScheme,
    policy: MergePolicy,
    format: Format,
    retry: RetryPolicy,
}

impl DocumentWriter {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            scheme: PartitionScheme::from_config(config),
            policy: MergePolicy::new(config.reference_list_keys.iter().cloned()),
            format: config.format,
            retry: RetryPolicy::new(config.lock_retries, config.retry_backoff_ms),
        }
    }

    pub fn scheme(&self) -> &PartitionScheme {
        &self.scheme
    }

    pub fn policy(&self) -> &MergePolicy {
        &self.policy
    }

    /// Resolve a pipeline-supplied kind name and id into a key.
    pub fn key(&self, kind: &str, id: &str) -> Result<StorageKey> {
        let kind: Kind = self.scheme.kinds().resolve(kind)?;
        StorageKey::new(kind, id)
    }

    /// Merge `body` into the file for `key`, retrying transient failures.
    pub fn commit(&self, key: &StorageKey, body: &Value) -> Result<CommitOutcome> {
        let path = self.scheme.path(key);
        self.retry.run(|| {
            let _lock = DocumentLock::try_acquire(&path)?;

            let (merged, conflicts, status) = match fsio::read_json(&path)? {
                None => {
                    let mut fresh = body.clone();
                    self.policy.normalize(&mut fresh);
                    (fresh, Vec::new(), CommitStatus::Created)
                }
                Some(existing) => {
                    let before = existing.clone();
                    let (merged, conflicts) = self.policy.merge(existing, body.clone());
                    let status = if merged == before {
                        CommitStatus::Unchanged
                    } else {
                        CommitStatus::Merged
                    };
                    (merged, conflicts, status)
                }
            };

            if status != CommitStatus::Unchanged {
                fsio::write_atomic(&path, &self.format.render(&merged)?)?;
            }
            debug!(%key, ?status, "committed document");
            Ok(CommitOutcome { status, conflicts })
        })
    }

    /// Read the stored document for `key`, if any.
    pub fn load(&self, key: &StorageKey) -> Result<Option<Value>> {
        fsio::read_json(&self.scheme.path(key))
    }
}

/// Reject bodies that are not JSON-LD nodes.
pub(crate) fn ensure_object(key: &StorageKey, body: &Value) -> Result<()> {
    if body.is_object() {
        Ok(())
    } else {
        Err(LdStoreError::malformed(format!(
            "document for {key} must be a JSON object"
        )))
    }
}

pub(crate) fn log_conflicts(key: &StorageKey, conflicts: &[MergeConflict]) {
    for conflict in conflicts {
        warn!(
            %key,
            path = %conflict.path,
            previous = %conflict.previous,
            incoming = %conflict.incoming,
            "merge conflict, keeping incoming value"
        );
    }
}

// ---------------------------------------------------------------------------
// DiskStore
// ---------------------------------------------------------------------------

/// Store that merges into the backing file on every put.
#[derive(Debug)]
pub struct DiskStore {
    writer: DocumentWriter,
    summary: StoreSummary,
}

impl DiskStore {
    /// Open a store rooted at `config.root`, creating the directory if needed.
    #[instrument(skip_all, fields(root = %config.root.display()))]
    pub fn open(config: &StoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.root).map_err(|e| LdStoreError::io(&config.root, e))?;
        debug!("disk store opened");
        Ok(Self {
            writer: DocumentWriter::new(config),
            summary: StoreSummary::default(),
        })
    }

    pub fn writer(&self) -> &DocumentWriter {
        &self.writer
    }

    fn put_inner(&mut self, key: &StorageKey, body: Value) -> Result<()> {
        ensure_object(key, &body)?;
        let outcome = self.writer.commit(key, &body)?;
        log_conflicts(key, &outcome.conflicts);
        self.summary.record(outcome.status, outcome.conflicts.len());
        Ok(())
    }
}

impl DocumentStore for DiskStore {
    fn put(&mut self, kind: &str, id: &str, body: Value) -> Result<()> {
        self.summary.puts += 1;
        let result = self
            .writer
            .key(kind, id)
            .and_then(|key| self.put_inner(&key, body));
        if let Err(e) = &result {
            self.summary.fail(format!("{kind}/{id}"), e);
        }
        result
    }

    fn put_raw(&mut self, kind: &str, id: &str, text: &str) -> Result<()> {
        match parse_body(kind, id, text) {
            Ok(body) => self.put(kind, id, body),
            Err(e) => {
                self.summary.puts += 1;
                self.summary.fail(format!("{kind}/{id}"), &e);
                Err(e)
            }
        }
    }

    fn get(&self, kind: &str, id: &str) -> Result<Option<Value>> {
        self.writer.load(&self.writer.key(kind, id)?)
    }

    fn flush(&mut self) -> Result<StoreSummary> {
        Ok(self.summary.clone())
    }

    fn summary(&self) -> &StoreSummary {
        &self.summary
    }
}
