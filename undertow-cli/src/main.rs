//! Undertow CLI - Command-line harness
//!
//! Drives simulated piece downloads through the streaming pipeline, either
//! into a file or over HTTP.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use undertow_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "undertow")]
#[command(about = "Ordered streaming over out-of-order piece downloads")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// Console log level (overridden by RUST_LOG)
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Directory for the per-run debug log
    #[arg(long)]
    logs_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_file = init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())?;
    tracing::debug!("Debug log at {}", log_file.display());

    commands::handle_command(cli.command).await
}
