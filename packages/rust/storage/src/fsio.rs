//! Locked, atomic file primitives shared by the stores and the rewrite pass.
//!
//! Every read-modify-write of a document happens while holding an advisory
//! exclusive lock on a sidecar `.<name>.lock` file in the same directory, and
//! every write goes through a temp file plus rename. Lock files are never
//! removed; deleting them would let two writers lock different inodes.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use serde_json::Value;
use tracing::debug;

use ldstore_shared::{LdStoreError, Result};

/// Upper bound for a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Locking
// ---------------------------------------------------------------------------

/// Sidecar lock path for a document.
pub fn lock_path(doc_path: &Path) -> PathBuf {
    let name = doc_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    doc_path.with_file_name(format!(".{name}.lock"))
}

/// Exclusive advisory lock on one document; released on drop.
#[derive(Debug)]
pub struct DocumentLock {
    file: File,
}

impl DocumentLock {
    /// Try once to lock `doc_path`. Contention is reported as `LockContention`.
    pub fn try_acquire(doc_path: &Path) -> Result<Self> {
        let path = lock_path(doc_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LdStoreError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| LdStoreError::io(&path, e))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { file }),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(LdStoreError::LockContention { path, attempts: 1 })
            }
            Err(e) => Err(LdStoreError::io(&path, e)),
        }
    }
}

impl Drop for DocumentLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

// ---------------------------------------------------------------------------
// Reading & writing
// ---------------------------------------------------------------------------

/// Read and parse a stored document. A missing file is `Ok(None)`.
pub fn read_json(path: &Path) -> Result<Option<Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(LdStoreError::io(path, e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| LdStoreError::corrupt(path, e))
}

/// Write `contents` to `path` atomically: temp file in the same directory,
/// fsync, then rename over the target.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| LdStoreError::validation(format!("{} has no parent", path.display())))?;
    std::fs::create_dir_all(parent).map_err(|e| LdStoreError::io(parent, e))?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = parent.join(format!(".{name}.tmp.{}", uuid::Uuid::now_v7()));

    let result = (|| {
        let mut file = File::create(&temp).map_err(|e| LdStoreError::io(&temp, e))?;
        file.write_all(contents.as_bytes())
            .map_err(|e| LdStoreError::io(&temp, e))?;
        file.sync_all().map_err(|e| LdStoreError::io(&temp, e))?;
        std::fs::rename(&temp, path).map_err(|e| LdStoreError::io(path, e))
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp);
    }
    result?;

    debug!(path = %path.display(), bytes = contents.len(), "wrote document");
    Ok(())
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Bounded retry with exponential backoff for retryable errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, at least one.
    pub attempts: u32,
    /// Delay before the second attempt; doubled for each further one, capped.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff_ms: u64) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff: Duration::from_millis(backoff_ms),
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are exhausted.
    pub fn run<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    debug!(attempt, error = %e, "retrying after transient failure");
                    std::thread::sleep(delay);
                    delay = delay.saturating_mul(2).min(MAX_BACKOFF);
                    attempt += 1;
                }
                Err(LdStoreError::LockContention { path, .. }) => {
                    return Err(LdStoreError::LockContention {
                        path,
                        attempts: attempt,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, 25)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ldstore-fsio-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let tmp = temp_dir();
        let target = tmp.join("ab").join("doc.json");

        write_atomic(&target, r#"{"a":1}"#).unwrap();
        write_atomic(&target, r#"{"a":2}"#).unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), r#"{"a":2}"#);
        for entry in std::fs::read_dir(target.parent().unwrap()).unwrap() {
            let name = entry.unwrap().file_name().to_string_lossy().to_string();
            assert!(!name.contains(".tmp."), "temp file left behind: {name}");
        }

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn read_json_missing_and_corrupt() {
        let tmp = temp_dir();
        assert!(read_json(&tmp.join("absent.json")).unwrap().is_none());

        let bad = tmp.join("bad.json");
        std::fs::write(&bad, "{not json").unwrap();
        assert!(matches!(
            read_json(&bad),
            Err(LdStoreError::CorruptStoreEntry { .. })
        ));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn lock_is_exclusive_until_dropped() {
        let tmp = temp_dir();
        let doc = tmp.join("doc.json");

        let held = DocumentLock::try_acquire(&doc).unwrap();
        assert!(matches!(
            DocumentLock::try_acquire(&doc),
            Err(LdStoreError::LockContention { .. })
        ));
        drop(held);
        assert!(DocumentLock::try_acquire(&doc).is_ok());
        assert!(lock_path(&doc).exists());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn retry_recovers_from_transient_errors() {
        let policy = RetryPolicy::new(3, 1);
        let mut calls = 0;
        let value = policy
            .run(|| {
                calls += 1;
                if calls < 3 {
                    Err(LdStoreError::io("/x", std::io::Error::other("flaky")))
                } else {
                    Ok(7)
                }
            })
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls, 3);
    }

    #[test]
    fn retry_reports_attempts_on_contention() {
        let policy = RetryPolicy::new(4, 1);
        let err = policy
            .run::<()>(|| {
                Err(LdStoreError::LockContention {
                    path: "/x.lock".into(),
                    attempts: 1,
                })
            })
            .unwrap_err();
        assert!(matches!(err, LdStoreError::LockContention { attempts: 4, .. }));
    }

    #[test]
    fn retry_does_not_repeat_permanent_errors() {
        let policy = RetryPolicy::new(5, 1);
        let mut calls = 0;
        let _ = policy.run::<()>(|| {
            calls += 1;
            Err(LdStoreError::malformed("bad"))
        });
        assert_eq!(calls, 1);
    }
}
