mod config;
mod grpc;
mod handlers;
mod jobs;
mod placement;
mod planner;
mod registry;
mod store;

use std::sync::Arc;

use clap::Parser;
use cosmos_common::proto::control_plane_server::ControlPlaneServer;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::ControllerConfig;
use grpc::ControlPlaneService;
use handlers::HandlerContext;
use planner::Planner;
use registry::StreamRegistry;
use store::{ControllerStore, PostgresStore};

#[derive(Debug, Parser)]
#[command(name = "cosmosd", about = "Cosmos fleet deployment controller")]
struct Args {
    /// Path to a TOML config file (overlaid with COSMOS__* env vars).
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
    let config = Arc::new(ControllerConfig::load(args.config.as_deref())?);

    let store: Arc<dyn ControllerStore> = Arc::new(PostgresStore::connect(&config.database_url).await?);
    let registry = StreamRegistry::new();

    let handler_ctx = Arc::new(HandlerContext {
        store: store.clone(),
        registry: registry.clone(),
        http: reqwest::Client::new(),
        external_bulk_dispatcher_url: config.external_bulk_dispatcher_url.clone(),
        external_orchestrator_url: config.external_orchestrator_url.clone(),
    });
    let planner = Arc::new(Planner::new(store.clone(), handler_ctx));

    let job_handles = jobs::spawn_all(store.clone(), config.clone());

    let service = ControlPlaneService { store: store.clone(), registry: registry.clone(), planner };
    let addr = format!("0.0.0.0:{}", config.stream_port).parse()?;
    info!(%addr, "cosmosd listening for agent control streams");

    let mut server_builder = Server::builder();
    if let (Some(cert_path), Some(key_path)) = (&config.tls_cert_path, &config.tls_key_path) {
        let cert = tokio::fs::read(cert_path).await?;
        let key = tokio::fs::read(key_path).await?;
        let identity = tonic::transport::Identity::from_pem(cert, key);
        let mut tls_config = tonic::transport::ServerTlsConfig::new().identity(identity);
        if let Some(ca_path) = &config.tls_client_ca_path {
            let ca = tokio::fs::read(ca_path).await?;
            tls_config = tls_config.client_ca_root(tonic::transport::Certificate::from_pem(ca));
        }
        server_builder = server_builder.tls_config(tls_config)?;
        info!("TLS enabled for control-plane stream server");
    }

    server_builder
        .add_service(ControlPlaneServer::new(service))
        .serve_with_shutdown(addr, shutdown_signal())
        .await?;

    info!("stopping background jobs");
    for handle in job_handles {
        handle.abort();
    }

    info!("cosmosd shut down cleanly");
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
