use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mnp_agent::{AgentConfig, Cli, CrictlResolver, Datastore, Orchestrator};
use mnp_netns::NftApplier;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mnp_agent=info,mnp_policy=info,mnp_netns=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = AgentConfig::from_cli(&cli).context("Invalid configuration")?;
    info!("Starting multi-network policy agent on node {}", config.node_name);

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let datastore = Arc::new(Datastore::new());
    let resolver = Arc::new(CrictlResolver::new(
        config.runtime_endpoint.clone(),
        config.host_prefix.clone(),
        Duration::from_secs(30),
    ));
    let filter = Arc::new(NftApplier::default());
    let orchestrator = Arc::new(Orchestrator::new(
        datastore.clone(),
        resolver,
        filter,
        config.common_rules.clone(),
        config.allowed_plugins.clone(),
    ));

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = mnp_agent::watch::run(client, datastore, orchestrator, config.node_name.clone()) => {
            result.context("Watch loop terminated")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, shutting down");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
    }

    Ok(())
}
