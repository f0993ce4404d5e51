//! Application configuration for ldstore.
//!
//! User config lives at `~/.ldstore/ldstore.toml`.
//! Environment variables override config file values, CLI flags override both.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LdStoreError, Result};
use crate::types::{Format, KindTable};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "ldstore.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".ldstore";

/// Overrides `[store] output_dir`.
pub const OUTPUT_ENV: &str = "LDSTORE_OUTPUT";

/// When set to a truthy value, forces pretty serialization.
pub const DEBUG_ENV: &str = "LDSTORE_DEBUG";

// ---------------------------------------------------------------------------
// Config structs (matching ldstore.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Document store settings.
    #[serde(default)]
    pub store: StoreSection,

    /// Merge policy settings.
    #[serde(default)]
    pub merge: MergeConfig,

    /// Rewrite pass settings.
    #[serde(default)]
    pub rewrite: RewriteSection,

    /// Kind name → directory overrides.
    #[serde(default)]
    pub kinds: BTreeMap<String, String>,
}

/// Which document store strategy a run uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Read-merge-write against disk on every put.
    #[default]
    Disk,
    /// Accumulate in memory, write everything on flush.
    Memory,
}

impl std::str::FromStr for Strategy {
    type Err = LdStoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "disk" => Ok(Strategy::Disk),
            "memory" => Ok(Strategy::Memory),
            other => Err(LdStoreError::config(format!(
                "unknown strategy '{other}': expected 'disk' or 'memory'"
            ))),
        }
    }
}

/// `[store]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    /// Root output directory of the corpus.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Serialization style: "compact" or "pretty".
    #[serde(default)]
    pub format: Format,

    /// Write strategy: "disk" or "memory".
    #[serde(default)]
    pub strategy: Strategy,

    /// Number of hash-bucket directory levels under each kind.
    #[serde(default = "default_partition_levels")]
    pub partition_levels: u8,

    /// Attempts for lock acquisition and retryable I/O.
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,

    /// Initial backoff between attempts, doubled each retry.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            format: Format::default(),
            strategy: Strategy::default(),
            partition_levels: default_partition_levels(),
            lock_retries: default_lock_retries(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

fn default_output_dir() -> String {
    "./output".into()
}
fn default_partition_levels() -> u8 {
    1
}
fn default_lock_retries() -> u32 {
    5
}
fn default_retry_backoff() -> u64 {
    25
}

/// `[merge]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Property names whose array values are sets of references.
    #[serde(default = "default_reference_list_keys")]
    pub reference_list_keys: Vec<String>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            reference_list_keys: default_reference_list_keys(),
        }
    }
}

fn default_reference_list_keys() -> Vec<String> {
    [
        "identified_by",
        "referred_to_by",
        "classified_as",
        "carried_out_by",
        "part_of",
        "member_of",
        "about",
        "represents",
        "influenced_by",
        "used_specific_object",
        "transferred_title_of",
        "transferred_title_from",
        "transferred_title_to",
        "took_place_at",
        "equivalent",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// `[rewrite]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteSection {
    /// Worker count; 0 picks the available parallelism.
    #[serde(default)]
    pub workers: usize,

    /// Failure ratio above which a pass is considered systemic and aborted.
    #[serde(default = "default_max_failure_ratio")]
    pub max_failure_ratio: f64,

    /// Completed documents required before the ratio is evaluated.
    #[serde(default = "default_min_failure_samples")]
    pub min_failure_samples: usize,
}

impl Default for RewriteSection {
    fn default() -> Self {
        Self {
            workers: 0,
            max_failure_ratio: default_max_failure_ratio(),
            min_failure_samples: default_min_failure_samples(),
        }
    }
}

fn default_max_failure_ratio() -> f64 {
    0.5
}
fn default_min_failure_samples() -> usize {
    20
}

// ---------------------------------------------------------------------------
// Runtime configs (resolved from AppConfig + overrides)
// ---------------------------------------------------------------------------

/// Runtime store configuration handed to a store at construction.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root output directory.
    pub root: PathBuf,
    /// Serialization style.
    pub format: Format,
    /// Hash-bucket directory levels.
    pub partition_levels: u8,
    /// Attempts for lock acquisition and retryable I/O.
    pub lock_retries: u32,
    /// Initial retry backoff in ms.
    pub retry_backoff_ms: u64,
    /// Kind → directory table.
    pub kinds: KindTable,
    /// Reference-list property names.
    pub reference_list_keys: Vec<String>,
}

impl StoreConfig {
    /// Resolve and validate the store configuration.
    pub fn from_app(config: &AppConfig) -> Result<Self> {
        if !(1..=4).contains(&config.store.partition_levels) {
            return Err(LdStoreError::config(format!(
                "partition_levels must be between 1 and 4, got {}",
                config.store.partition_levels
            )));
        }
        if config.store.lock_retries == 0 {
            return Err(LdStoreError::config("lock_retries must be at least 1"));
        }

        Ok(Self {
            root: PathBuf::from(&config.store.output_dir),
            format: config.store.format,
            partition_levels: config.store.partition_levels,
            lock_retries: config.store.lock_retries,
            retry_backoff_ms: config.store.retry_backoff_ms,
            kinds: KindTable::new(&config.kinds)?,
            reference_list_keys: config.merge.reference_list_keys.clone(),
        })
    }

    /// Defaults rooted at `root`, for tests and embedding.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            format: Format::Compact,
            partition_levels: default_partition_levels(),
            lock_retries: default_lock_retries(),
            retry_backoff_ms: default_retry_backoff(),
            kinds: KindTable::default(),
            reference_list_keys: default_reference_list_keys(),
        }
    }
}

/// Runtime rewrite configuration.
#[derive(Debug, Clone)]
pub struct RewriteConfig {
    /// Concurrent worker tasks.
    pub workers: usize,
    /// Abort threshold on the failure ratio.
    pub max_failure_ratio: f64,
    /// Samples needed before the threshold applies.
    pub min_failure_samples: usize,
}

impl RewriteConfig {
    /// Resolve worker count and validate the abort threshold.
    pub fn from_app(config: &AppConfig) -> Result<Self> {
        let ratio = config.rewrite.max_failure_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(LdStoreError::config(format!(
                "max_failure_ratio must be within [0, 1], got {ratio}"
            )));
        }

        let workers = match config.rewrite.workers {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            n => n,
        };

        Ok(Self {
            workers,
            max_failure_ratio: ratio,
            min_failure_samples: config.rewrite.min_failure_samples,
        })
    }
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_failure_ratio: default_max_failure_ratio(),
            min_failure_samples: default_min_failure_samples(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.ldstore/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| LdStoreError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.ldstore/ldstore.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    let mut config = if path.exists() {
        load_config_from(&path)?
    } else {
        tracing::debug!(?path, "config file not found, using defaults");
        AppConfig::default()
    };

    config.apply_env_overrides(|name| std::env::var(name).ok());
    Ok(config)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| LdStoreError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| LdStoreError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| LdStoreError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| LdStoreError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| LdStoreError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

impl AppConfig {
    /// Apply `LDSTORE_OUTPUT` / `LDSTORE_DEBUG` using the given variable lookup.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(OUTPUT_ENV).filter(|v| !v.is_empty()) {
            self.store.output_dir = dir;
        }
        if let Some(flag) = lookup(DEBUG_ENV) {
            if matches!(flag.to_ascii_lowercase().as_str(), "1" | "true" | "yes") {
                self.store.format = Format::Pretty;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("output_dir"));
        assert!(toml_str.contains("reference_list_keys"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.store.partition_levels, 1);
        assert_eq!(parsed.store.strategy, Strategy::Disk);
        assert_eq!(parsed.store.format, Format::Compact);
    }

    #[test]
    fn config_with_kinds_and_sections() {
        let toml_str = r#"
[store]
output_dir = "/tmp/corpus"
format = "pretty"
strategy = "memory"
partition_levels = 2

[merge]
reference_list_keys = ["identified_by"]

[rewrite]
workers = 3

[kinds]
Person = "people"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.store.format, Format::Pretty);
        assert_eq!(config.store.strategy, Strategy::Memory);
        assert_eq!(config.merge.reference_list_keys, vec!["identified_by"]);

        let store = StoreConfig::from_app(&config).expect("store config");
        assert_eq!(store.partition_levels, 2);
        assert_eq!(store.kinds.dir(crate::Kind::Person), "people");

        let rewrite = RewriteConfig::from_app(&config).expect("rewrite config");
        assert_eq!(rewrite.workers, 3);
    }

    #[test]
    fn store_config_rejects_bad_partition_levels() {
        let mut config = AppConfig::default();
        config.store.partition_levels = 0;
        assert!(StoreConfig::from_app(&config).is_err());
        config.store.partition_levels = 9;
        assert!(StoreConfig::from_app(&config).is_err());
    }

    #[test]
    fn store_config_rejects_unknown_kind_override() {
        let mut config = AppConfig::default();
        config.kinds.insert("Unicorn".into(), "unicorns".into());
        let err = StoreConfig::from_app(&config).unwrap_err();
        assert!(err.to_string().contains("Unicorn"));
    }

    #[test]
    fn rewrite_config_auto_workers() {
        let config = AppConfig::default();
        let rewrite = RewriteConfig::from_app(&config).expect("rewrite config");
        assert!(rewrite.workers >= 1);

        let mut bad = AppConfig::default();
        bad.rewrite.max_failure_ratio = 1.5;
        assert!(RewriteConfig::from_app(&bad).is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = AppConfig::default();
        config.apply_env_overrides(|name| match name {
            OUTPUT_ENV => Some("/data2/output".into()),
            DEBUG_ENV => Some("true".into()),
            _ => None,
        });
        assert_eq!(config.store.output_dir, "/data2/output");
        assert_eq!(config.store.format, Format::Pretty);
    }

    #[test]
    fn strategy_parses() {
        assert_eq!("memory".parse::<Strategy>().expect("parse"), Strategy::Memory);
        assert!("tape".parse::<Strategy>().is_err());
    }
}
