use chrono::{DateTime, Utc};
use cosmos_common::{ComponentDeploymentStatus, DeploymentStatus, HealthStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Deployment {
    pub id: Uuid,
    pub configuration_json: String,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Deployment {
    pub fn status(&self) -> DeploymentStatus {
        match self.status.as_str() {
            "running" => DeploymentStatus::Running,
            "completed" => DeploymentStatus::Completed,
            "failed" => DeploymentStatus::Failed,
            _ => DeploymentStatus::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewDeploymentLogEntry {
    pub deployment_id: Uuid,
    pub component_name: Option<String>,
    pub node_hostname: Option<String>,
    pub operation: String,
    pub status: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeploymentLogEntry {
    pub id: i64,
    pub deployment_id: Uuid,
    pub component_name: Option<String>,
    pub node_hostname: Option<String>,
    pub operation: String,
    pub status: String,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The controller's record of a component's desired state (§3).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ComponentRow {
    pub name: String,
    pub kind: String,
    pub hash: String,
    pub tags_json: String,
    pub content_json: String,
    pub env_json: String,
    pub args_json: String,
    pub handler: String,
    pub managed: bool,
    pub health_check_json: Option<String>,
    pub deployment_id: Uuid,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ComponentDeploymentRow {
    pub component_name: String,
    pub node_hostname: String,
    pub status: String,
    pub message: Option<String>,
    pub pid: Option<i32>,
    pub health_status: String,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub deployed_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl ComponentDeploymentRow {
    pub fn new(component_name: impl Into<String>, node_hostname: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            component_name: component_name.into(),
            node_hostname: node_hostname.into(),
            status: ComponentDeploymentStatus::Deploying.as_str().to_string(),
            message: Some("sent".to_string()),
            pid: None,
            health_status: HealthStatus::Unknown.as_str().to_string(),
            last_started_at: None,
            last_health_check: None,
            deployed_at: now,
            last_updated: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AgentRow {
    pub hostname: String,
    pub version: String,
    pub last_heartbeat: DateTime<Utc>,
    pub online: bool,
    pub component_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NodeRow {
    pub hostname: String,
    pub ip: Option<String>,
    pub tags_json: String,
    pub online: bool,
    pub has_agent: bool,
    pub last_seen: DateTime<Utc>,
}

impl NodeRow {
    pub fn tags(&self) -> Vec<String> {
        serde_json::from_str(&self.tags_json).unwrap_or_default()
    }
}
