//! ldstore CLI: merging JSON-LD document store.
//!
//! Ingests partial resource descriptions into a partitioned on-disk corpus
//! and rewrites identifier prefixes across it.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
