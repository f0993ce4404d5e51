//! Deterministic `(kind, id)` → path mapping.
//!
//! Layout:
//! ```text
//! <root>/<kind dir>/<bucket>[/<bucket>...]/<encoded id>.json
//! ```
//! Buckets are two-hex-digit slices of the SHA-256 of the identifier, so each
//! level fans out to at most 256 directories regardless of corpus size.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::warn;
use walkdir::WalkDir;

use ldstore_shared::{KindTable, StorageKey, StoreConfig};

/// File extension of stored documents.
pub const DOCUMENT_EXTENSION: &str = "json";

/// Encoded identifiers longer than this are shortened with a hash suffix.
const MAX_STEM_LEN: usize = 160;

/// Maps storage keys to filesystem paths and enumerates the stored corpus.
#[derive(Debug, Clone)]
pub struct PartitionScheme {
    root: PathBuf,
    levels: u8,
    kinds: KindTable,
}

impl PartitionScheme {
    pub fn new(root: impl Into<PathBuf>, levels: u8, kinds: KindTable) -> Self {
        Self {
            root: root.into(),
            levels: levels.clamp(1, 4),
            kinds,
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(&config.root, config.partition_levels, config.kinds.clone())
    }

    /// Root output directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn kinds(&self) -> &KindTable {
        &self.kinds
    }

    /// Bucket directory names for `id`, outermost first.
    pub fn buckets(&self, id: &str) -> Vec<String> {
        let digest = Sha256::digest(id.as_bytes());
        digest
            .iter()
            .take(usize::from(self.levels))
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// Full path of the document stored under `key`.
    pub fn path(&self, key: &StorageKey) -> PathBuf {
        let mut path = self.root.join(self.kinds.dir(key.kind));
        for bucket in self.buckets(&key.id) {
            path.push(bucket);
        }
        path.push(file_name(&key.id));
        path
    }

    /// List every stored document file, sorted, along with the parts of the
    /// tree that could not be read. Lock and temp files are skipped.
    pub fn enumerate(&self) -> CorpusListing {
        let depth = usize::from(self.levels) + 1;
        let mut listing = CorpusListing::default();

        for (kind, dir) in self.kinds.iter() {
            let kind_root = self.root.join(dir);
            if !kind_root.is_dir() {
                continue;
            }

            for entry in WalkDir::new(&kind_root).min_depth(depth).max_depth(depth) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        let path = e.path().unwrap_or(&kind_root).to_path_buf();
                        warn!(%kind, path = %path.display(), error = %e, "unreadable corpus entry");
                        listing.unreadable.push(UnreadableEntry {
                            path,
                            error: e.to_string(),
                        });
                        continue;
                    }
                };
                if entry.file_type().is_file() && is_document_file(entry.path()) {
                    listing.documents.push(entry.into_path());
                }
            }
        }

        listing.documents.sort();
        listing.unreadable.sort_by(|a, b| a.path.cmp(&b.path));
        listing
    }
}

/// Result of walking the corpus tree.
#[derive(Debug, Clone, Default)]
pub struct CorpusListing {
    /// Stored document files, sorted.
    pub documents: Vec<PathBuf>,
    /// Directories or files the walk could not read.
    pub unreadable: Vec<UnreadableEntry>,
}

/// A part of the corpus tree that could not be listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadableEntry {
    pub path: PathBuf,
    pub error: String,
}

/// Leaf file name for `id`.
///
/// The identifier is form-urlencoded, which is injective, so distinct ids never
/// share a file name. Very long encodings keep a readable prefix followed by
/// `~` and the full SHA-256; `~` never appears in an encoded id. A leading
/// `.` is escaped so no document is mistaken for a hidden lock or temp file.
pub fn file_name(id: &str) -> String {
    let mut encoded: String = url::form_urlencoded::byte_serialize(id.as_bytes()).collect();
    if encoded.starts_with('.') {
        encoded.replace_range(..1, "%2E");
    }
    let stem = if encoded.len() > MAX_STEM_LEN {
        // The encoding is pure ASCII, any byte index is a char boundary.
        let digest = Sha256::digest(id.as_bytes());
        format!("{}~{:x}", &encoded[..64], digest)
    } else {
        encoded
    };
    format!("{stem}.{DOCUMENT_EXTENSION}")
}

/// Whether `path` names a stored document (not a lock or temp file).
pub fn is_document_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    !name.starts_with('.')
        && path.extension().and_then(|e| e.to_str()) == Some(DOCUMENT_EXTENSION)
}
