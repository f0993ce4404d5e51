//! Run-level workflows for ldstore.
//!
//! This crate ties the store to its two batch entry points: ingesting
//! `(kind, id, document)` records into a [`DocumentStore`](ldstore_storage::DocumentStore),
//! and rewriting identifier prefixes across the stored corpus.

pub mod pipeline;
pub mod rewrite;
