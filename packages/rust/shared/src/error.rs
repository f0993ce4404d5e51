//! Error types for ldstore.
//!
//! Library crates use [`LdStoreError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all ldstore operations.
#[derive(Debug, thiserror::Error)]
pub enum LdStoreError {
    /// Incoming document could not be represented as a JSON-LD node.
    #[error("malformed input: {message}")]
    MalformedInput { message: String },

    /// A stored file exists but does not parse as JSON.
    #[error("corrupt store entry at {path:?}: {source}")]
    CorruptStoreEntry {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The advisory lock on a document could not be acquired.
    #[error("lock contention on {path:?} after {attempts} attempts")]
    LockContention { path: PathBuf, attempts: u32 },

    /// Rewrite mapping file missing or invalid.
    #[error("mapping file error: {message}")]
    MappingFile { message: String },

    /// Kind name not present in the kind table.
    #[error("unknown kind '{kind}'")]
    UnknownKind { kind: String },

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Data validation error.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Too many documents failed during a pass; the pass was aborted.
    #[error("aborted after {failed} of {processed} documents failed")]
    SystemicFailure { failed: usize, processed: usize },

    /// A worker task panicked or was cancelled.
    #[error("task error: {0}")]
    Task(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, LdStoreError>;

impl LdStoreError {
    /// Create a malformed-input error from any displayable message.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedInput {
            message: msg.into(),
        }
    }

    /// Create a mapping file error from any displayable message.
    pub fn mapping(msg: impl Into<String>) -> Self {
        Self::MappingFile {
            message: msg.into(),
        }
    }

    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap a JSON parse failure of a stored file.
    pub fn corrupt(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::CorruptStoreEntry {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the same operation could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::LockContention { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = LdStoreError::mapping("expected a JSON object");
        assert_eq!(err.to_string(), "mapping file error: expected a JSON object");

        let err = LdStoreError::UnknownKind {
            kind: "Spaceship".into(),
        };
        assert!(err.to_string().contains("Spaceship"));
    }

    #[test]
    fn retryable_classification() {
        let io = LdStoreError::io("/tmp/x", std::io::Error::other("disk hiccup"));
        assert!(io.is_retryable());

        let lock = LdStoreError::LockContention {
            path: "/tmp/x".into(),
            attempts: 3,
        };
        assert!(lock.is_retryable());

        let parse_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(!LdStoreError::corrupt("/tmp/x", parse_err).is_retryable());
        assert!(!LdStoreError::malformed("nope").is_retryable());
    }
}
