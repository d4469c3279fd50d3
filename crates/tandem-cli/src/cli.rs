//! Clap CLI definitions for Tandem.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  tandem run                                Start a node with ~/.tandem/config.toml
  tandem run --listen 0.0.0.0:30303         Override the listen address
  tandem run --dial 10.0.0.7:30303          Dial a peer at startup
  tandem caps                               Print the advertised capability list";

/// Tandem: many sub-protocols over one peer connection.
#[derive(Parser)]
#[command(name = "tandem", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a node running the built-in protocols until Ctrl+C.
    Run {
        /// Address to listen on (overrides the config file).
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Peer address to dial at startup. Repeatable.
        #[arg(long)]
        dial: Vec<SocketAddr>,
    },
    /// Print the canonical capability list this node advertises.
    Caps,
}
