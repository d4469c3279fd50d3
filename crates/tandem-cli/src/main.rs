//! Tandem CLI: run a multiplexing peer node from the terminal.
//!
//! `tandem run` starts a node with the built-in protocols, dials the
//! configured bootstrap peers and runs until Ctrl+C.

mod cli;
mod config;
mod echo;

use crate::cli::{Cli, Commands};
use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::Path;
use tandem_wire::{PeerNode, ProtocolRegistry};
use tracing::info;

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Protocols every node built by this binary runs.
fn builtin_protocols(node_name: &str) -> anyhow::Result<ProtocolRegistry> {
    let registry = ProtocolRegistry::new();
    registry
        .register(echo::protocol(node_name))
        .context("registering echo protocol")?;
    Ok(registry)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing_stderr();

    match cli.command {
        Commands::Run { listen, dial } => {
            let rt = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
            rt.block_on(cmd_run(cli.config.as_deref(), listen, dial))
        }
        Commands::Caps => cmd_caps(cli.config.as_deref()),
    }
}

async fn cmd_run(
    config_path: Option<&Path>,
    listen: Option<SocketAddr>,
    dial: Vec<SocketAddr>,
) -> anyhow::Result<()> {
    let mut config = config::load_config(config_path);
    if let Some(listen) = listen {
        config.listen_addr = listen;
    }
    config.bootstrap.extend(dial);
    let grace = config.session_shutdown_grace();

    let protocols = builtin_protocols(&config.node_name)?;
    let (node, accept_task) = PeerNode::start(config, protocols)
        .await
        .context("starting node")?;
    let dial_task = node.start_dialer();

    println!("{}", serde_json::to_string_pretty(&node.node_info())?);

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl+C")?;
    info!("Interrupted, shutting down");

    node.shutdown();
    let _ = accept_task.await;
    let _ = dial_task.await;
    // Let peers send their disconnect and sessions wind down.
    tokio::time::sleep(grace).await;
    Ok(())
}

fn cmd_caps(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = config::load_config(config_path);
    let protocols = builtin_protocols(&config.node_name)?;
    for cap in protocols.caps() {
        println!("{cap}");
    }
    Ok(())
}
