mod config;
mod health;
mod lifecycle;
mod progress;
mod reconcile;
mod session;
mod store;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::AgentConfig;
use health::HealthChecker;
use lifecycle::LifecycleEngine;
use reconcile::Reconciler;
use session::ControlSession;
use store::{AgentStore, SqliteStore};

#[derive(Debug, Parser)]
#[command(name = "cosmos-agentd", about = "Cosmos fleet agent")]
struct Args {
    /// Path to a TOML config file (overlaid with COSMOS_AGENT__* env vars).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let config = AgentConfig::load(args.config.as_deref())?;
    let hostname = config.resolved_hostname()?;

    tokio::fs::create_dir_all(config.programs_dir()).await?;
    tokio::fs::create_dir_all(config.scripts_dir()).await?;
    tokio::fs::create_dir_all(config.logs_dir()).await?;

    let store: Arc<dyn AgentStore> =
        Arc::new(SqliteStore::connect(&config.db_path().to_string_lossy()).await?);

    let session = ControlSession::new(&config, hostname.clone());
    let inbound_rx = session.take_inbound();

    let lifecycle = Arc::new(LifecycleEngine::new(
        store.clone(),
        session.clone(),
        config.programs_dir(),
        config.scripts_dir(),
        config.logs_dir(),
    ));
    let health = Arc::new(HealthChecker::new(store.clone()));

    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        lifecycle,
        health,
        session.clone(),
        Duration::from_secs(config.reconcile_interval_secs),
        Duration::from_secs(config.heartbeat_interval_secs),
    ));

    info!(%hostname, controller = %config.controller_url, "cosmos-agentd starting");

    session.start();
    reconciler.start(inbound_rx);

    shutdown_signal().await;
    info!("shutting down cosmos-agentd");
    session.stop();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
