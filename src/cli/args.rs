use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "voxedge", version, about = "Voice-interaction edge server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the edge server.
    Start(StartArgs),
    /// Parse and validate a configuration file, then exit.
    CheckConfig(CheckConfigArgs),
}

#[derive(Debug, Args)]
pub struct StartArgs {
    /// Configuration file (TOML or JSON). Defaults to VOXEDGE_CONFIG or
    /// config/voxedge.toml.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct CheckConfigArgs {
    pub config: PathBuf,
}
