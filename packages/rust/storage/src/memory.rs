//! Memory-buffered document store.
//!
//! Puts are merged into an in-process map and nothing touches disk until
//! [`DocumentStore::flush`]. Flush merges every pending body with whatever is
//! already stored, through the same locked cycle the disk store uses, so a
//! memory run on top of an earlier corpus still converges. Content not
//! flushed before the process exits is lost.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{info, instrument, warn};

use ldstore_shared::{LdStoreError, Result, StorageKey, StoreConfig};

use crate::disk::{DocumentWriter, ensure_object, log_conflicts};
use crate::{DocumentStore, StoreSummary, parse_body};

/// Store that buffers merged documents until flush.
#[derive(Debug)]
pub struct MemoryStore {
    writer: DocumentWriter,
    pending: BTreeMap<StorageKey, Value>,
    summary: StoreSummary,
}

impl MemoryStore {
    /// Create a store that will flush under `config.root`.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.root).map_err(|e| LdStoreError::io(&config.root, e))?;
        Ok(Self {
            writer: DocumentWriter::new(config),
            pending: BTreeMap::new(),
            summary: StoreSummary::default(),
        })
    }

    /// Number of distinct keys waiting for flush.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn put_inner(&mut self, key: StorageKey, mut body: Value) -> Result<()> {
        ensure_object(&key, &body)?;
        match self.pending.remove(&key) {
            Some(existing) => {
                let (merged, conflicts) = self.writer.policy().merge(existing, body);
                log_conflicts(&key, &conflicts);
                self.summary.conflicts += conflicts.len();
                self.pending.insert(key, merged);
            }
            None => {
                self.writer.policy().normalize(&mut body);
                self.pending.insert(key, body);
            }
        }
        Ok(())
    }
}

impl DocumentStore for MemoryStore {
    fn put(&mut self, kind: &str, id: &str, body: Value) -> Result<()> {
        self.summary.puts += 1;
        let result = self
            .writer
            .key(kind, id)
            .and_then(|key| self.put_inner(key, body));
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

    #[instrument(skip_all, fields(pending = self.pending.len()))]
    fn flush(&mut self) -> Result<StoreSummary> {
        let pending = std::mem::take(&mut self.pending);
        let total = pending.len();

        for (key, body) in pending {
            match self.writer.commit(&key, &body) {
                Ok(outcome) => {
                    log_conflicts(&key, &outcome.conflicts);
                    self.summary.record(outcome.status, outcome.conflicts.len());
                }
                Err(e) => self.summary.fail(key.to_string(), &e),
            }
        }

        info!(
            documents = total,
            written = self.summary.written(),
            failed = self.summary.failed.len(),
            "memory store flushed"
        );
        Ok(self.summary.clone())
    }

    fn summary(&self) -> &StoreSummary {
        &self.summary
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            warn!(
                pending = self.pending.len(),
                "memory store dropped without flush, buffered documents are lost"
            );
        }
    }
}
