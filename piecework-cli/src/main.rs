//! Piecework CLI - Command-line interface
//!
//! Downloads and seeds torrents, and creates `.torrent` files from local content.

mod commands;

use clap::Parser;
use piecework_core::config::PieceworkConfig;
use piecework_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "piecework")]
#[command(about = "A BitTorrent piece-exchange client")]
struct Cli {
    /// Console log level; the trace file always records everything
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info, global = true)]
    log_level: CliLogLevel,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = PieceworkConfig::from_env();

    init_tracing(cli.log_level.as_tracing_level(), &config.storage.logs_dir)?;

    commands::handle_command(cli.command, config).await
}
