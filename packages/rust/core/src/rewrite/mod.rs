//! Bulk identifier rewriting over a stored corpus.

pub mod engine;
pub mod map;

pub use engine::{FailedDocument, RewriteEngine, RewriteReport};
pub use map::{RewriteMap, RewriteRule};
