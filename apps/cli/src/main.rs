//! matflow CLI: two-stage LLM pipeline over a material catalog.
//!
//! Profiles every catalog record against a schema, then matches each
//! profiled record against the others, resuming from where the last run
//! stopped.

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
