//! CLI argument parsing for sm

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "sm")]
#[command(author, version, about = "Status monitor dispatch core", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Dispatch a newline-delimited JSON feed to the configured watches
    Run {
        /// Feed file (default: stdin)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// JSON object of status values used to backfill new subscribers
        #[arg(short, long)]
        snapshot: Option<PathBuf>,

        /// Extra channels to print, comma separated
        #[arg(long)]
        channels: Option<String>,
    },

    /// Print the effective configuration
    Config,
}
