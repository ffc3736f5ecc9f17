//! lodestard: the Lodestar registry daemon.
//!
//! Single binary that runs one registry node:
//! - Naming store and registry facade
//! - Distro replication (push-on-write, anti-entropy, handoff)
//! - Health monitor and lease reaper
//! - UDP push service
//! - Peer protocol API
//!
//! # Usage
//!
//! ```text
//! lodestard --config /etc/lodestar/lodestar.toml
//! lodestard --node-id 10.0.0.1:8848 --bind 0.0.0.0:8848 \
//!     --peer 10.0.0.1:8848 --peer 10.0.0.2:8848 --peer 10.0.0.3:8848
//! ```

mod node;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use lodestar_core::LodestarConfig;

#[derive(Parser, Debug)]
#[command(name = "lodestard", about = "Lodestar service registry node")]
struct Cli {
    /// Path to lodestar.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Peer protocol listen address.
    #[arg(long)]
    bind: Option<String>,

    /// UDP address for client pushes.
    #[arg(long)]
    push_bind: Option<String>,

    /// Cluster member (repeatable). Replaces the configured peer list.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Node identity as peers address it.
    #[arg(long)]
    node_id: Option<String>,

    /// Print the effective configuration and exit.
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,lodestard=debug,lodestar=debug")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    if cli.print_config {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    node::run_node(config).await
}

/// File (or defaults), then command-line overrides.
fn load_config(cli: &Cli) -> anyhow::Result<LodestarConfig> {
    let mut config = match &cli.config {
        Some(path) => LodestarConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => LodestarConfig::default(),
    };

    if let Some(bind) = &cli.bind {
        config.node.bind = bind.clone();
    }
    if let Some(push_bind) = &cli.push_bind {
        config.node.push_bind = push_bind.clone();
    }
    if let Some(node_id) = &cli.node_id {
        config.node.id = Some(node_id.clone());
    }
    if !cli.peers.is_empty() {
        config.cluster.peers = cli.peers.clone();
    }

    config.validate()?;
    Ok(config)
}
