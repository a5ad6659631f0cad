//! `cosmosctl` — the thin operator CLI referenced in SPEC_FULL.md §0.
//!
//! Not the out-of-scope HTTP/REST API or web dashboard: it is the one
//! "how does a user submit a configuration" surface the core spec needs
//! to be exercisable, talking to the controller over the same tonic
//! service C6 already defines (`SubmitDeployment`, §6).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use cosmos_common::proto::control_plane_client::ControlPlaneClient;
use cosmos_common::proto::SubmitDeploymentRequest;
use cosmos_common::{sha256_hex, DesiredConfiguration};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cosmosctl", about = "Cosmos fleet deployment CLI", version)]
struct Cli {
    /// Controller stream address, `host:port` (§6 "Control configuration").
    #[arg(long, global = true, default_value = "127.0.0.1:9091")]
    controller: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Submit a desired configuration (JSON) and start reconciliation.
    Submit {
        /// Path to a JSON file encoding a `DesiredConfiguration` (§3, §9
        /// "Opaque configuration envelope"). Use `-` for stdin.
        file: PathBuf,
    },
    /// Compute the SHA-256 content hash (§3) a component config needs.
    Hash {
        /// Path to the file whose content hash identifies the artifact.
        file: PathBuf,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Submit { file } => submit(&cli.controller, &file).await,
        Commands::Hash { file } => hash(&file).await,
    }
}

async fn submit(controller: &str, file: &PathBuf) -> anyhow::Result<()> {
    let raw = if file.as_os_str() == "-" {
        read_stdin()?
    } else {
        std::fs::read_to_string(file)?
    };

    // Validate shape locally before round-tripping to the controller so
    // a malformed file fails fast with a useful message.
    let config: DesiredConfiguration = serde_json::from_str(&raw)?;
    let configuration_json = serde_json::to_string(&config)?;

    let endpoint = format!("http://{controller}");
    let mut client = ControlPlaneClient::connect(endpoint).await?;
    let response = client
        .submit_deployment(SubmitDeploymentRequest { configuration_json })
        .await?
        .into_inner();

    println!("deployment {}", response.deployment_id);
    Ok(())
}

async fn hash(file: &PathBuf) -> anyhow::Result<()> {
    let content = std::fs::read(file)?;
    println!("{}", sha256_hex(&content));
    Ok(())
}

fn read_stdin() -> anyhow::Result<String> {
    use std::io::Read;
    let mut buf = String::new();
    std::io::stdin().read_to_string(&mut buf)?;
    Ok(buf)
}
