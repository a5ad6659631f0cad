//! Background jobs (C9, §4.9).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::config::ControllerConfig;
use crate::store::{ControllerStore, NodeRow};

/// Spawns the offline sweeper, node sync, and retention loops. Each
/// returns its `JoinHandle` so the caller can await/cancel them on
/// shutdown.
pub fn spawn_all(store: Arc<dyn ControllerStore>, config: Arc<ControllerConfig>) -> Vec<tokio::task::JoinHandle<()>> {
    vec![
        tokio::spawn(offline_sweeper(store.clone(), config.clone())),
        tokio::spawn(node_sync(store.clone(), config.clone())),
        tokio::spawn(retention(store, config)),
    ]
}

/// Marks any agent whose last heartbeat predates the offline threshold
/// offline, every `offline_sweep_interval_secs` (default 60s, §4.9).
async fn offline_sweeper(store: Arc<dyn ControllerStore>, config: Arc<ControllerConfig>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(config.offline_sweep_interval_secs));
    loop {
        ticker.tick().await;
        let cutoff = Utc::now() - chrono::Duration::seconds(config.offline_after_secs);
        match store.mark_stale_agents_offline(cutoff).await {
            Ok(count) if count > 0 => info!(count, "marked stale agents offline"),
            Ok(_) => {}
            Err(err) => error!(%err, "offline sweep failed"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct NodeDirectoryEntry {
    hostname: String,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

/// Refreshes the node roster from an external node directory, every
/// `node_sync_interval_secs` (default 5min, §4.9), overlaying
/// `has_agent` from the current Agent records.
async fn node_sync(store: Arc<dyn ControllerStore>, config: Arc<ControllerConfig>) {
    let Some(url) = config.node_directory_url.clone() else {
        return;
    };
    let client = reqwest::Client::new();
    let mut ticker = tokio::time::interval(Duration::from_secs(config.node_sync_interval_secs));
    loop {
        ticker.tick().await;
        if let Err(err) = sync_once(&client, &url, &store).await {
            warn!(%err, "node directory sync failed");
        }
    }
}

async fn sync_once(client: &reqwest::Client, url: &str, store: &Arc<dyn ControllerStore>) -> anyhow::Result<()> {
    let entries: Vec<NodeDirectoryEntry> = client.get(url).send().await?.error_for_status()?.json().await?;
    let agents = store.list_agents().await?;
    let agent_hostnames: std::collections::HashSet<String> = agents.into_iter().map(|a| a.hostname).collect();

    for entry in entries {
        let has_agent = agent_hostnames.contains(&entry.hostname);
        store
            .upsert_node(NodeRow {
                hostname: entry.hostname,
                ip: entry.ip,
                tags_json: serde_json::to_string(&entry.tags).unwrap_or_default(),
                online: true,
                has_agent,
                last_seen: Utc::now(),
            })
            .await?;
    }
    Ok(())
}

/// Deletes terminal deployments older than `retention_cutoff_days`
/// (default 30d), every `retention_interval_secs` (default 24h, §4.9).
/// Per SPEC_FULL.md §2, `DeploymentLog` rows are kept for audit.
async fn retention(store: Arc<dyn ControllerStore>, config: Arc<ControllerConfig>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(config.retention_interval_secs));
    loop {
        ticker.tick().await;
        let cutoff = Utc::now() - chrono::Duration::days(config.retention_cutoff_days);
        match store.cleanup_deployments_older_than(cutoff).await {
            Ok(count) if count > 0 => info!(count, "pruned old terminal deployments"),
            Ok(_) => {}
            Err(err) => error!(%err, "deployment retention sweep failed"),
        }
    }
}
