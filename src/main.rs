//! voxedge - unified CLI entrypoint.
//!
//! Usage:
//!   voxedge start --config config/voxedge.toml
//!   voxedge check-config config/voxedge.toml

use anyhow::Result;
use clap::Parser;
use voxedge::cli::commands::{run_check_config, run_start};
use voxedge::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::CheckConfig(args) => run_check_config(args),
    }
}
