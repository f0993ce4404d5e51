//! Parallel corpus rewrite pass.
//!
//! Every stored document is handled by one blocking task: lock, read,
//! rewrite string leaves, re-normalize, atomic write-back only if something
//! changed.
//! Documents are independent, so an interrupted pass is finished by running
//! it again.

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use ldstore_shared::{Format, LdStoreError, Result, RewriteConfig, StoreConfig};
use ldstore_storage::fsio::{self, DocumentLock};
use ldstore_storage::{MergePolicy, PartitionScheme, RetryPolicy};

use super::map::RewriteMap;
use crate::pipeline::ProgressReporter;

/// A document the pass could not process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedDocument {
    pub path: PathBuf,
    pub error: String,
}

/// Outcome of a completed pass.
#[derive(Debug, Clone)]
pub struct RewriteReport {
    pub started_at: DateTime<Utc>,
    /// Documents processed, successfully or not.
    pub scanned: usize,
    /// Documents written back.
    pub rewritten: usize,
    /// Documents with no matching string.
    pub unchanged: usize,
    /// String leaves replaced across all documents.
    pub strings_rewritten: usize,
    /// Failed documents and unreadable parts of the tree, sorted by path.
    pub failed: Vec<FailedDocument>,
    pub elapsed: Duration,
}

/// Applies a [`RewriteMap`] to every document under a store root.
#[derive(Debug, Clone)]
pub struct RewriteEngine {
    scheme: PartitionScheme,
    policy: Arc<MergePolicy>,
    format: Format,
    retry: RetryPolicy,
    config: RewriteConfig,
}

impl RewriteEngine {
    pub fn new(store: &StoreConfig, config: RewriteConfig) -> Self {
        Self {
            scheme: PartitionScheme::from_config(store),
            policy: Arc::new(MergePolicy::new(store.reference_list_keys.iter().cloned())),
            format: store.format,
            retry: RetryPolicy::new(store.lock_retries, store.retry_backoff_ms),
            config,
        }
    }

    /// Rewrite the whole corpus.
    ///
    /// Fails before touching anything if the root is not a readable
    /// directory. Per-document failures are reported, unless they exceed the
    /// configured ratio, in which case outstanding work is cancelled and the
    /// pass fails with `SystemicFailure`.
    #[instrument(skip_all, fields(root = %self.scheme.root().display(), rules = map.len()))]
    pub async fn run(
        &self,
        map: Arc<RewriteMap>,
        progress: &dyn ProgressReporter,
    ) -> Result<RewriteReport> {
        let started_at = Utc::now();
        let start = Instant::now();

        preflight(self.scheme.root())?;

        progress.phase("Scanning corpus");
        let listing = self.scheme.enumerate();
        let total = listing.documents.len();
        info!(
            documents = total,
            unreadable = listing.unreadable.len(),
            workers = self.config.workers,
            "starting rewrite pass"
        );

        let mut report = RewriteReport {
            started_at,
            scanned: 0,
            rewritten: 0,
            unchanged: 0,
            strings_rewritten: 0,
            failed: listing
                .unreadable
                .into_iter()
                .map(|entry| FailedDocument {
                    path: entry.path,
                    error: entry.error,
                })
                .collect(),
            elapsed: Duration::ZERO,
        };
        // Only documents that were attempted count toward the abort ratio.
        let mut document_failures = 0;

        progress.phase("Rewriting");
        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut tasks: JoinSet<(PathBuf, Result<usize>)> = JoinSet::new();
        let mut queue = listing.documents.into_iter();

        loop {
            // Keep every permit busy; a permit is released when its task returns.
            while let Ok(permit) = semaphore.clone().try_acquire_owned() {
                let Some(path) = queue.next() else {
                    break;
                };
                let map = Arc::clone(&map);
                let policy = Arc::clone(&self.policy);
                let format = self.format;
                let retry = self.retry;
                tasks.spawn_blocking(move || {
                    let _permit = permit;
                    guarded(path, |path| {
                        rewrite_document(path, &map, &policy, format, retry)
                    })
                });
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            report.scanned += 1;
            match joined {
                Ok((_, Ok(0))) => report.unchanged += 1,
                Ok((path, Ok(count))) => {
                    debug!(path = %path.display(), strings = count, "document rewritten");
                    report.rewritten += 1;
                    report.strings_rewritten += count;
                }
                Ok((path, Err(e))) => {
                    warn!(path = %path.display(), error = %e, "document rewrite failed");
                    document_failures += 1;
                    report.failed.push(FailedDocument {
                        path,
                        error: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!(error = %e, "rewrite task failed");
                    document_failures += 1;
                    report.failed.push(FailedDocument {
                        path: PathBuf::new(),
                        error: LdStoreError::Task(e.to_string()).to_string(),
                    });
                }
            }
            progress.document_done(report.scanned, total);

            if self.is_systemic(document_failures, report.scanned) {
                error!(
                    failed = document_failures,
                    processed = report.scanned,
                    "failure ratio exceeded, aborting rewrite pass"
                );
                tasks.abort_all();
                // Blocking tasks already running finish their document.
                while tasks.join_next().await.is_some() {}
                return Err(LdStoreError::SystemicFailure {
                    failed: document_failures,
                    processed: report.scanned,
                });
            }
        }

        report.failed.sort_by(|a, b| a.path.cmp(&b.path));
        report.elapsed = start.elapsed();

        progress.finished(&format!(
            "{} documents, {} rewritten, {} failed",
            report.scanned,
            report.rewritten,
            report.failed.len()
        ));
        info!(
            scanned = report.scanned,
            rewritten = report.rewritten,
            unchanged = report.unchanged,
            strings = report.strings_rewritten,
            failed = report.failed.len(),
            elapsed_ms = report.elapsed.as_millis(),
            "rewrite pass complete"
        );
        Ok(report)
    }

    fn is_systemic(&self, failed: usize, processed: usize) -> bool {
        failed > 0
            && processed >= self.config.min_failure_samples
            && failed as f64 / processed as f64 > self.config.max_failure_ratio
    }
}

/// The root must exist and be listable before anything is modified.
fn preflight(root: &Path) -> Result<()> {
    let meta = std::fs::metadata(root).map_err(|e| LdStoreError::io(root, e))?;
    if !meta.is_dir() {
        return Err(LdStoreError::validation(format!(
            "{} is not a directory",
            root.display()
        )));
    }
    std::fs::read_dir(root).map_err(|e| LdStoreError::io(root, e))?;
    Ok(())
}

/// Run `op` on `path`, turning a panic into a task error for that path.
fn guarded(path: PathBuf, op: impl FnOnce(&Path) -> Result<usize>) -> (PathBuf, Result<usize>) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| op(&path))).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic with non-string payload".to_string());
        Err(LdStoreError::Task(message))
    });
    (path, result)
}

/// Rewrite one stored document under its lock; returns strings changed.
///
/// A rewritten document is normalized again, since two identifiers that
/// now coincide may leave duplicate entries in a reference list.
fn rewrite_document(
    path: &Path,
    map: &RewriteMap,
    policy: &MergePolicy,
    format: Format,
    retry: RetryPolicy,
) -> Result<usize> {
    retry.run(|| {
        let _lock = DocumentLock::try_acquire(path)?;
        let Some(mut doc) = fsio::read_json(path)? else {
            return Ok(0);
        };
        let count = map.rewrite_value(&mut doc);
        if count > 0 {
            policy.normalize(&mut doc);
            fsio::write_atomic(path, &format.render(&doc)?)?;
        }
        Ok(count)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SilentProgress;
    use ldstore_storage::{DiskStore, DocumentStore};
    use serde_json::json;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("ldstore-rewrite-{}", uuid::Uuid::now_v7()))
    }

    fn seed(root: &Path, count: usize) -> DiskStore {
        let mut store = DiskStore::open(&StoreConfig::at(root)).unwrap();
        for i in 0..count {
            store
                .put(
                    "HumanMadeObject",
                    &format!("obj-{i}"),
                    json!({
                        "id": format!("urn:old:{i}"),
                        "carried_out_by": [{"id": "urn:old:123/extra"}],
                        "_label": "untouched"
                    }),
                )
                .unwrap();
        }
        store
    }

    fn engine(root: &Path) -> RewriteEngine {
        RewriteEngine::new(&StoreConfig::at(root), RewriteConfig::default())
    }

    fn map() -> Arc<RewriteMap> {
        Arc::new(
            RewriteMap::from_rules([("urn:old:123", "urn:new:abc"), ("urn:old:", "urn:new:")])
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn rewrites_every_document() {
        let root = temp_dir();
        let store = seed(&root, 10);

        let report = engine(&root).run(map(), &SilentProgress).await.unwrap();
        assert_eq!(report.scanned, 10);
        assert_eq!(report.rewritten, 10);
        assert_eq!(report.strings_rewritten, 20);
        assert!(report.failed.is_empty());

        let doc = store.get("HumanMadeObject", "obj-3").unwrap().unwrap();
        assert_eq!(doc["id"], "urn:new:3");
        assert_eq!(doc["carried_out_by"][0]["id"], "urn:new:abc/extra");
        assert_eq!(doc["_label"], "untouched");

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn second_pass_changes_nothing() {
        let root = temp_dir();
        let store = seed(&root, 5);
        let engine = engine(&root);

        engine.run(map(), &SilentProgress).await.unwrap();
        let after_first = store.get("HumanMadeObject", "obj-0").unwrap();

        let report = engine.run(map(), &SilentProgress).await.unwrap();
        assert_eq!(report.rewritten, 0);
        assert_eq!(report.unchanged, 5);
        assert_eq!(store.get("HumanMadeObject", "obj-0").unwrap(), after_first);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn rerun_completes_an_interrupted_pass() {
        let root = temp_dir();
        let store = seed(&root, 6);
        let map = map();

        // A pass that died after handling two documents.
        let scheme = PartitionScheme::from_config(&StoreConfig::at(&root));
        let policy = MergePolicy::default();
        for path in scheme.enumerate().documents.iter().take(2) {
            rewrite_document(path, &map, &policy, Format::Compact, RetryPolicy::default())
                .unwrap();
        }

        let report = engine(&root).run(map, &SilentProgress).await.unwrap();
        assert_eq!(report.rewritten, 4);
        assert_eq!(report.unchanged, 2);
        for i in 0..6 {
            let doc = store.get("HumanMadeObject", &format!("obj-{i}")).unwrap().unwrap();
            assert_eq!(doc["id"], format!("urn:new:{i}"));
        }

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn corrupt_documents_are_reported_not_fatal() {
        let root = temp_dir();
        seed(&root, 4);
        let scheme = PartitionScheme::from_config(&StoreConfig::at(&root));
        let victim = scheme.enumerate().documents[0].clone();
        std::fs::write(&victim, "{broken").unwrap();

        let report = engine(&root).run(map(), &SilentProgress).await.unwrap();
        assert_eq!(report.rewritten, 3);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].path, victim);
        assert_eq!(std::fs::read_to_string(&victim).unwrap(), "{broken");

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn widespread_failure_aborts_the_pass() {
        let root = temp_dir();
        seed(&root, 4);
        let scheme = PartitionScheme::from_config(&StoreConfig::at(&root));
        for path in scheme.enumerate().documents {
            std::fs::write(&path, "{broken").unwrap();
        }

        let config = RewriteConfig {
            workers: 1,
            max_failure_ratio: 0.5,
            min_failure_samples: 2,
        };
        let engine = RewriteEngine::new(&StoreConfig::at(&root), config);
        let err = engine.run(map(), &SilentProgress).await.unwrap_err();
        assert!(matches!(err, LdStoreError::SystemicFailure { failed: 2, processed: 2 }));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn merged_identifiers_collapse_reference_lists() {
        let root = temp_dir();
        let mut store = DiskStore::open(&StoreConfig::at(&root)).unwrap();
        store
            .put(
                "Activity",
                "sale-1",
                json!({"carried_out_by": [{"id": "urn:sale:A"}, {"id": "urn:sale:B"}]}),
            )
            .unwrap();

        let map = Arc::new(
            RewriteMap::from_rules([("urn:sale:A", "urn:canon:X"), ("urn:sale:B", "urn:canon:X")])
                .unwrap(),
        );
        let report = engine(&root).run(map, &SilentProgress).await.unwrap();
        assert_eq!(report.rewritten, 1);

        let doc = store.get("Activity", "sale-1").unwrap().unwrap();
        assert_eq!(doc["carried_out_by"], json!([{"id": "urn:canon:X"}]));

        // The rewritten file is already in merged form.
        let mut fresh = DiskStore::open(&StoreConfig::at(&root)).unwrap();
        fresh
            .put("Activity", "sale-1", json!({"carried_out_by": [{"id": "urn:canon:X"}]}))
            .unwrap();
        assert_eq!(fresh.summary().unchanged, 1);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn panicking_document_keeps_its_path() {
        let path = PathBuf::from("/corpus/people/ab/p1.json");
        let (kept, result) = guarded(path.clone(), |_| panic!("bad document"));
        assert_eq!(kept, path);
        assert!(matches!(result, Err(LdStoreError::Task(message)) if message == "bad document"));

        let (_, result) = guarded(path, |_| panic!("{} documents", 2));
        assert!(matches!(result, Err(LdStoreError::Task(message)) if message == "2 documents"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreadable_buckets_are_reported() {
        use std::os::unix::fs::PermissionsExt;

        let root = temp_dir();
        seed(&root, 4);
        let scheme = PartitionScheme::from_config(&StoreConfig::at(&root));
        let hidden = scheme.enumerate().documents[0].clone();
        let bucket = hidden.parent().unwrap().to_path_buf();
        let before = std::fs::read_to_string(&hidden).unwrap();

        std::fs::set_permissions(&bucket, std::fs::Permissions::from_mode(0o000)).unwrap();
        let readable_anyway = std::fs::read_dir(&bucket).is_ok();
        let result = engine(&root).run(map(), &SilentProgress).await;
        std::fs::set_permissions(&bucket, std::fs::Permissions::from_mode(0o755)).unwrap();

        if !readable_anyway {
            let report = result.unwrap();
            assert!(report.failed.iter().any(|f| f.path == bucket));
            assert!(report.rewritten < 4);
            assert_eq!(std::fs::read_to_string(&hidden).unwrap(), before);
        }
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn missing_root_fails_before_any_work() {
        let root = temp_dir();
        let err = engine(&root).run(map(), &SilentProgress).await.unwrap_err();
        assert!(matches!(err, LdStoreError::Io { .. }));
    }

    #[tokio::test]
    async fn invalid_map_leaves_corpus_untouched() {
        let root = temp_dir();
        let store = seed(&root, 2);
        let before = store.get("HumanMadeObject", "obj-1").unwrap();

        let loaded = RewriteMap::from_json_str(r#"{"urn:old:": "urn:old:new:"}"#);
        assert!(matches!(loaded, Err(LdStoreError::MappingFile { .. })));
        assert_eq!(store.get("HumanMadeObject", "obj-1").unwrap(), before);

        let _ = std::fs::remove_dir_all(&root);
    }
}
