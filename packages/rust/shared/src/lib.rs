//! Shared types, error model, and configuration for ldstore.
//!
//! This crate is the foundation depended on by all other ldstore crates.
//! It provides:
//! - [`LdStoreError`]: the unified error type
//! - Domain types ([`Kind`], [`KindTable`], [`StorageKey`], [`Format`])
//! - Configuration ([`AppConfig`], [`StoreConfig`], [`RewriteConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, MergeConfig, RewriteConfig, RewriteSection, StoreConfig, StoreSection, Strategy,
    config_dir, config_file_path, init_config, load_config, load_config_from,
};
pub use error::{LdStoreError, Result};
pub use types::{Format, Kind, KindTable, StorageKey};
