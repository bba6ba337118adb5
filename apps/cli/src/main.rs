//! legisflow CLI: incremental bill processing pipeline.
//!
//! Converts a session's bills to Markdown, merges adopted amendments and
//! extracts policy answers with a language model, re-running only what
//! changed since the last run.

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
