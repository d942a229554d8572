//! Shoal CLI - Command-line interface
//!
//! Downloads a single torrent to a local directory.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use shoal_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "shoal")]
#[command(about = "A minimal BitTorrent download client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// Console log level
    #[arg(long, global = true, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Directory for the per-run trace log
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())?;

    if let Err(e) = commands::handle_command(cli.command).await {
        match e.downcast_ref::<shoal_core::ShoalError>() {
            Some(shoal_error) => eprintln!("Error: {}", shoal_error.user_message()),
            None => eprintln!("Error: {e:#}"),
        }
        std::process::exit(1);
    }

    Ok(())
}
