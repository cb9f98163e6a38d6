//! Gamedock agent daemon.
//!
//! Loads configuration, establishes the device identity, and runs the
//! TCP server until the process is stopped. There is no interactive
//! surface; everything else happens over the wire or through the
//! observer event queues.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use gamedock_core::{AgentConfig, AgentIdentity, AgentServer, AgentState, TokenStore};

/// Gamedock device agent.
#[derive(Parser)]
#[command(name = "gamedock-agentd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path (defaults to <state-dir>/agent.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// State directory for configuration and the hub store
    #[arg(short, long)]
    state_dir: Option<PathBuf>,

    /// Log level filter (overridden by RUST_LOG)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    let state_dir = cli.state_dir.unwrap_or_else(AgentConfig::default_state_dir);
    let config_path = cli.config.unwrap_or_else(|| state_dir.join("agent.toml"));

    let mut config =
        AgentConfig::load_or_default(&config_path).context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    let identity = AgentIdentity::ensure(&mut config, &config_path)
        .context("failed to establish agent identity")?;
    tracing::info!(
        agent_id = %identity.id,
        name = %identity.name,
        platform = %identity.platform,
        "agent identity loaded"
    );

    let store =
        TokenStore::open(state_dir.join("hubs.json")).context("failed to open hub store")?;
    tracing::info!(paired_hubs = store.len(), "hub store loaded");

    let state = std::sync::Arc::new(AgentState::new(config, identity, store));
    let server = AgentServer::bind(state)
        .await
        .context("failed to start listener")?;

    let handle = server.handle();
    let ad = handle.advertisement();
    tracing::info!(port = ad.port, "ready for discovery advertisement");

    server.run().await;
    Ok(())
}
