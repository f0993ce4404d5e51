//! CLI command definitions, routing, and tracing setup.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use ldstore_core::pipeline::{self, ProgressReporter};
use ldstore_core::rewrite::{RewriteEngine, RewriteMap};
use ldstore_shared::{
    AppConfig, RewriteConfig, StoreConfig, Strategy, init_config, load_config, load_config_from,
};
use ldstore_storage::{DocumentWriter, PartitionScheme, open_store};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// ldstore: accumulate JSON-LD fragments into one document per identifier.
#[derive(Parser)]
#[command(
    name = "ldstore",
    version,
    about = "Merge partial JSON-LD documents into a partitioned corpus and rewrite identifiers across it.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.ldstore/ldstore.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Corpus root, overriding config and LDSTORE_OUTPUT.
    #[arg(short, long, global = true)]
    pub output: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Merge NDJSON records `{"kind", "id", "document"}` into the store.
    Ingest {
        /// Input file; `-` or omitted reads stdin.
        file: Option<PathBuf>,

        /// Store strategy: disk or memory (defaults to config).
        #[arg(long)]
        strategy: Option<Strategy>,
    },

    /// Rewrite identifier prefixes across every stored document.
    Rewrite {
        /// JSON mapping file `{"old prefix": "new prefix", ...}`.
        map: PathBuf,

        /// Concurrent workers (defaults to config, 0 = CPU count).
        #[arg(long)]
        workers: Option<usize>,

        /// Exit non-zero if any document failed.
        #[arg(long)]
        strict: bool,
    },

    /// Print the file path a document is stored at.
    Locate {
        /// Kind name, e.g. Person.
        kind: String,
        /// Document identifier.
        id: String,
    },

    /// Print a stored document.
    Show {
        /// Kind name, e.g. Person.
        kind: String,
        /// Document identifier.
        id: String,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "ldstore=info",
        1 => "ldstore=debug",
        _ => "ldstore=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config = resolve_config(cli.config.as_deref(), cli.output.as_deref())?;

    match cli.command {
        Command::Ingest { file, strategy } => cmd_ingest(&config, file.as_deref(), strategy),
        Command::Rewrite {
            map,
            workers,
            strict,
        } => cmd_rewrite(&config, &map, workers, strict).await,
        Command::Locate { kind, id } => cmd_locate(&config, &kind, &id),
        Command::Show { kind, id } => cmd_show(&config, &kind, &id),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(&config),
        },
    }
}

/// Load config from `--config` or the default location, then apply
/// environment and flag overrides.
fn resolve_config(path: Option<&Path>, output: Option<&Path>) -> Result<AppConfig> {
    let mut config = match path {
        Some(path) => {
            let mut config = load_config_from(path)?;
            config.apply_env_overrides(|name| std::env::var(name).ok());
            config
        }
        None => load_config()?,
    };
    if let Some(output) = output {
        config.store.output_dir = output.to_string_lossy().into_owned();
    }
    Ok(config)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

fn cmd_ingest(config: &AppConfig, file: Option<&Path>, strategy: Option<Strategy>) -> Result<()> {
    let store_config = StoreConfig::from_app(config)?;
    let strategy = strategy.unwrap_or(config.store.strategy);

    let source = file.unwrap_or(Path::new("-"));
    let reader: Box<dyn BufRead> = if source == Path::new("-") {
        Box::new(std::io::stdin().lock())
    } else {
        let f = std::fs::File::open(source)
            .map_err(|e| eyre!("cannot open input '{}': {e}", source.display()))?;
        Box::new(std::io::BufReader::new(f))
    };

    info!(
        root = %store_config.root.display(),
        ?strategy,
        input = %source.display(),
        "ingesting records"
    );

    let mut store = open_store(&store_config, strategy)?;
    let reporter = CliProgress::new();
    let summary = pipeline::ingest(reader, source, store.as_mut(), &reporter)?;

    println!();
    println!("  Ingest complete");
    println!("  Records:    {}", summary.lines);
    println!("  Created:    {}", summary.store.created);
    println!("  Merged:     {}", summary.store.merged);
    println!("  Unchanged:  {}", summary.store.unchanged);
    println!("  Conflicts:  {}", summary.store.conflicts);
    println!("  Malformed:  {}", summary.malformed_lines.len());
    println!("  Failed:     {}", summary.store.failed.len());
    println!("  Time:       {:.1}s", summary.elapsed.as_secs_f64());
    for line in &summary.malformed_lines {
        println!("    line {line}: not a record");
    }
    for failed in &summary.store.failed {
        println!("    {}: {}", failed.key, failed.error);
    }
    println!();

    Ok(())
}

async fn cmd_rewrite(
    config: &AppConfig,
    map_path: &Path,
    workers: Option<usize>,
    strict: bool,
) -> Result<()> {
    // The map is loaded and validated before the corpus is touched.
    let map = Arc::new(RewriteMap::from_file(map_path)?);
    let store_config = StoreConfig::from_app(config)?;
    let mut rewrite_config = RewriteConfig::from_app(config)?;
    if let Some(n) = workers.filter(|n| *n > 0) {
        rewrite_config.workers = n;
    }

    info!(
        root = %store_config.root.display(),
        map = %map_path.display(),
        rules = map.len(),
        workers = rewrite_config.workers,
        "rewriting corpus"
    );

    let engine = RewriteEngine::new(&store_config, rewrite_config);
    let reporter = CliProgress::new();
    let report = engine.run(map, &reporter).await?;

    println!();
    println!("  Rewrite complete");
    println!("  Scanned:    {}", report.scanned);
    println!("  Rewritten:  {}", report.rewritten);
    println!("  Unchanged:  {}", report.unchanged);
    println!("  Strings:    {}", report.strings_rewritten);
    println!("  Failed:     {}", report.failed.len());
    println!("  Time:       {:.1}s", report.elapsed.as_secs_f64());
    for failed in &report.failed {
        println!("    {}: {}", failed.path.display(), failed.error);
    }
    println!();

    if strict && !report.failed.is_empty() {
        return Err(eyre!(
            "{} documents failed to rewrite; re-run to retry them",
            report.failed.len()
        ));
    }
    Ok(())
}

fn cmd_locate(config: &AppConfig, kind: &str, id: &str) -> Result<()> {
    let store_config = StoreConfig::from_app(config)?;
    let writer = DocumentWriter::new(&store_config);
    let key = writer.key(kind, id)?;
    let path = PartitionScheme::from_config(&store_config).path(&key);
    println!("{}", path.display());
    Ok(())
}

fn cmd_show(config: &AppConfig, kind: &str, id: &str) -> Result<()> {
    let store_config = StoreConfig::from_app(config)?;
    let writer = DocumentWriter::new(&store_config);
    let key = writer.key(kind, id)?;
    let doc = writer
        .load(&key)?
        .ok_or_else(|| eyre!("no document stored for {key}"))?;
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn document_done(&self, current: usize, total: usize) {
        if total > 0 {
            self.spinner.set_message(format!("[{current}/{total}] documents"));
        } else {
            self.spinner.set_message(format!("{current} records"));
        }
    }

    fn finished(&self, message: &str) {
        self.spinner.finish_with_message(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rewrite_arguments() {
        let cli = Cli::try_parse_from(["ldstore", "rewrite", "map.json", "--workers", "8", "--strict"])
            .unwrap();
        match cli.command {
            Command::Rewrite {
                map,
                workers,
                strict,
            } => {
                assert_eq!(map, PathBuf::from("map.json"));
                assert_eq!(workers, Some(8));
                assert!(strict);
            }
            _ => panic!("expected rewrite"),
        }
    }

    #[test]
    fn rewrite_requires_a_map() {
        assert!(Cli::try_parse_from(["ldstore", "rewrite"]).is_err());
    }

    #[test]
    fn parses_ingest_strategy() {
        let cli = Cli::try_parse_from(["ldstore", "ingest", "records.ndjson", "--strategy", "memory"])
            .unwrap();
        match cli.command {
            Command::Ingest { file, strategy } => {
                assert_eq!(file, Some(PathBuf::from("records.ndjson")));
                assert_eq!(strategy, Some(Strategy::Memory));
            }
            _ => panic!("expected ingest"),
        }
        assert!(Cli::try_parse_from(["ldstore", "ingest", "--strategy", "cloud"]).is_err());
    }

    #[test]
    fn output_flag_overrides_config_file() {
        let path = std::env::temp_dir().join(format!("ldstore-cli-{}.toml", std::process::id()));
        std::fs::write(&path, "[store]\noutput_dir = \"/srv/corpus\"\npartition_levels = 2\n").unwrap();

        let from_file = resolve_config(Some(&path), None).unwrap();
        assert_eq!(from_file.store.partition_levels, 2);

        let overridden = resolve_config(Some(&path), Some(Path::new("/tmp/corpus"))).unwrap();
        assert_eq!(overridden.store.output_dir, "/tmp/corpus");
        assert_eq!(overridden.store.partition_levels, 2);

        let _ = std::fs::remove_file(&path);
    }
}
