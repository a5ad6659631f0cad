use chrono::{DateTime, Utc};
use cosmos_common::{HealthCheckType, HealthResult, RunStatus};

/// The agent's local record of a deployed component (§3 "Component (agent)").
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ComponentRow {
    pub name: String,
    pub kind: String,
    pub hash: String,
    pub source_url: Option<String>,
    pub encoding: Option<String>,
    pub content_inline: Option<Vec<u8>>,
    pub executable_path: Option<String>,
    pub env_json: String,
    pub args_json: String,
    pub managed: bool,
}

impl ComponentRow {
    pub fn env(&self) -> std::collections::BTreeMap<String, String> {
        serde_json::from_str(&self.env_json).unwrap_or_default()
    }

    pub fn args(&self) -> Vec<String> {
        serde_json::from_str(&self.args_json).unwrap_or_default()
    }
}

/// Per-component runtime status (§3 "ComponentStatus (agent)").
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ComponentStatusRow {
    pub name: String,
    pub status: String,
    pub message: String,
    pub pid: Option<i32>,
    pub restart_count: i64,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_checked_at: DateTime<Utc>,
}

impl ComponentStatusRow {
    pub fn default_for(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: RunStatus::Unknown.as_str().to_string(),
            message: String::new(),
            pid: None,
            restart_count: 0,
            last_started_at: None,
            last_checked_at: Utc::now(),
        }
    }

    pub fn run_status(&self) -> RunStatus {
        RunStatus::from_str_loose(&self.status)
    }
}

/// Health check configuration and counters (§3 "HealthCheck (agent)").
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HealthCheckRow {
    pub name: String,
    pub check_type: String,
    pub endpoint: String,
    pub interval_seconds: i64,
    pub timeout_seconds: i64,
    pub retries: i64,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_result: String,
    pub consecutive_failures: i64,
}

impl HealthCheckRow {
    pub fn check_type(&self) -> HealthCheckType {
        HealthCheckType::from_str_loose(&self.check_type).unwrap_or(HealthCheckType::Process)
    }

    pub fn last_result(&self) -> HealthResult {
        match self.last_result.as_str() {
            "success" => HealthResult::Success,
            "failure" => HealthResult::Failure,
            "reset" => HealthResult::Reset,
            _ => HealthResult::Empty,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_check_at {
            None => true,
            Some(last) => now > last + chrono::Duration::seconds(self.interval_seconds),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewDeploymentLogEntry {
    pub component_name: String,
    pub operation: String,
    pub status: String,
    pub message: Option<String>,
}
