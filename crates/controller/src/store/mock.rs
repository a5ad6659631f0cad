//! In-memory `ControllerStore` used by the planner's unit tests (§4.1).
//!
//! No Postgres instance is available in this environment; this mirrors
//! the same trait the `sqlx` implementation satisfies so the planner's
//! diff/dispatch logic gets real coverage without a live database.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use cosmos_common::DeploymentStatus;
use uuid::Uuid;

use super::models::*;
use super::ControllerStore;

#[derive(Default)]
struct Inner {
    deployments: HashMap<Uuid, Deployment>,
    log: Vec<DeploymentLogEntry>,
    components: HashMap<String, ComponentRow>,
    component_deployments: HashMap<(String, String), ComponentDeploymentRow>,
    agents: HashMap<String, AgentRow>,
    nodes: HashMap<String, NodeRow>,
    next_log_id: i64,
}

/// An in-memory stand-in for the Postgres-backed store, guarded by a
/// single mutex — adequate for tests, not for production concurrency.
pub struct MockStore {
    inner: Mutex<Inner>,
}

impl MockStore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }
}

impl Default for MockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControllerStore for MockStore {
    async fn create_deployment(&self, configuration_json: String) -> anyhow::Result<Deployment> {
        let mut inner = self.inner.lock().unwrap();
        let deployment = Deployment {
            id: Uuid::new_v4(),
            configuration_json,
            status: DeploymentStatus::Pending.as_str().to_string(),
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        inner.deployments.insert(deployment.id, deployment.clone());
        Ok(deployment)
    }

    async fn update_deployment_status(
        &self,
        id: Uuid,
        status: DeploymentStatus,
        error_message: Option<String>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(d) = inner.deployments.get_mut(&id) {
            d.status = status.as_str().to_string();
            d.error_message = error_message;
            let now = Utc::now();
            match status {
                DeploymentStatus::Running => {
                    d.started_at.get_or_insert(now);
                }
                DeploymentStatus::Completed | DeploymentStatus::Failed => {
                    d.completed_at.get_or_insert(now);
                }
                DeploymentStatus::Pending => {}
            }
        }
        Ok(())
    }

    async fn list_deployments(&self, limit: i64, offset: i64) -> anyhow::Result<Vec<Deployment>> {
        let inner = self.inner.lock().unwrap();
        let mut all: Vec<Deployment> = inner.deployments.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all.into_iter().skip(offset.max(0) as usize).take(limit.max(0) as usize).collect())
    }

    async fn get_deployment(&self, id: Uuid) -> anyhow::Result<Option<Deployment>> {
        Ok(self.inner.lock().unwrap().deployments.get(&id).cloned())
    }

    async fn append_deployment_log(&self, entry: NewDeploymentLogEntry) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_log_id;
        inner.next_log_id += 1;
        inner.log.push(DeploymentLogEntry {
            id,
            deployment_id: entry.deployment_id,
            component_name: entry.component_name,
            node_hostname: entry.node_hostname,
            operation: entry.operation,
            status: entry.status,
            message: entry.message,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn upsert_component(&self, component: ComponentRow) -> anyhow::Result<()> {
        self.inner.lock().unwrap().components.insert(component.name.clone(), component);
        Ok(())
    }

    async fn get_component(&self, name: &str) -> anyhow::Result<Option<ComponentRow>> {
        Ok(self.inner.lock().unwrap().components.get(name).cloned())
    }

    async fn list_components(&self) -> anyhow::Result<Vec<ComponentRow>> {
        Ok(self.inner.lock().unwrap().components.values().cloned().collect())
    }

    async fn delete_component(&self, name: &str) -> anyhow::Result<()> {
        self.inner.lock().unwrap().components.remove(name);
        Ok(())
    }

    async fn upsert_component_deployment(&self, row: ComponentDeploymentRow) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = (row.component_name.clone(), row.node_hostname.clone());
        inner.component_deployments.insert(key, row);
        Ok(())
    }

    async fn delete_component_deployments(&self, component_name: &str, hostnames: &[String]) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if hostnames.is_empty() {
            inner.component_deployments.retain(|(c, _), _| c != component_name);
        } else {
            for h in hostnames {
                inner.component_deployments.remove(&(component_name.to_string(), h.clone()));
            }
        }
        Ok(())
    }

    async fn list_component_deployments_by_component(&self, component_name: &str) -> anyhow::Result<Vec<ComponentDeploymentRow>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .component_deployments
            .values()
            .filter(|row| row.component_name == component_name)
            .cloned()
            .collect())
    }

    async fn list_component_deployments_by_node(&self, hostname: &str) -> anyhow::Result<Vec<ComponentDeploymentRow>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .component_deployments
            .values()
            .filter(|row| row.node_hostname == hostname)
            .cloned()
            .collect())
    }

    async fn upsert_agent(&self, agent: AgentRow) -> anyhow::Result<()> {
        self.inner.lock().unwrap().agents.insert(agent.hostname.clone(), agent);
        Ok(())
    }

    async fn list_agents(&self) -> anyhow::Result<Vec<AgentRow>> {
        Ok(self.inner.lock().unwrap().agents.values().cloned().collect())
    }

    async fn mark_stale_agents_offline(&self, cutoff: chrono::DateTime<Utc>) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let mut count = 0;
        for agent in inner.agents.values_mut() {
            if agent.online && agent.last_heartbeat < cutoff {
                agent.online = false;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn upsert_node(&self, node: NodeRow) -> anyhow::Result<()> {
        self.inner.lock().unwrap().nodes.insert(node.hostname.clone(), node);
        Ok(())
    }

    async fn list_nodes(&self, online_only: bool) -> anyhow::Result<Vec<NodeRow>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .nodes
            .values()
            .filter(|n| !online_only || n.online)
            .cloned()
            .collect())
    }

    async fn list_nodes_by_tags(&self, tags: &[String]) -> anyhow::Result<Vec<NodeRow>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .nodes
            .values()
            .filter(|n| {
                if tags.is_empty() {
                    true
                } else {
                    let node_tags = n.tags();
                    tags.iter().any(|t| node_tags.contains(t))
                }
            })
            .cloned()
            .collect())
    }

    async fn cleanup_deployments_older_than(&self, cutoff: chrono::DateTime<Utc>) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let stale: Vec<Uuid> = inner
            .deployments
            .values()
            .filter(|d| {
                matches!(d.status.as_str(), "completed" | "failed") && d.created_at < cutoff
            })
            .map(|d| d.id)
            .collect();
        let count = stale.len() as u64;
        for id in stale {
            inner.deployments.remove(&id);
        }
        Ok(count)
    }
}
