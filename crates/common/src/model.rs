//! Domain types shared between the controller and the agent (§3).
//!
//! These are the typed shapes both sides agree on; each store (C1, C2)
//! persists its own superset of fields alongside these.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// A component's kind (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Script,
    Program,
    Service,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Script => "script",
            ComponentKind::Program => "program",
            ComponentKind::Service => "service",
        }
    }
}

/// The dispatcher chosen to apply a component (§3, §9 "Handler polymorphism").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Handler {
    Agent,
    ExternalBulk,
    ExternalOrchestrator,
}

impl Handler {
    pub fn as_str(&self) -> &'static str {
        match self {
            Handler::Agent => "agent",
            Handler::ExternalBulk => "external-bulk",
            Handler::ExternalOrchestrator => "external-orchestrator",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Handler> {
        match s {
            "agent" => Some(Handler::Agent),
            "external-bulk" => Some(Handler::ExternalBulk),
            "external-orchestrator" => Some(Handler::ExternalOrchestrator),
            _ => None,
        }
    }

    /// Derive the default handler when unset on a component (§4.5 "Handler default").
    pub fn default_for(kind: ComponentKind, managed: bool) -> Handler {
        match (kind, managed) {
            (ComponentKind::Script, true) => Handler::Agent,
            (ComponentKind::Script, false) => Handler::ExternalBulk,
            (ComponentKind::Program, _) => Handler::Agent,
            (ComponentKind::Service, _) => Handler::ExternalOrchestrator,
        }
    }
}

/// How a component's content is delivered (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentEncoding {
    Plain,
    TarGz,
    Zip,
}

impl ContentEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentEncoding::Plain => "plain",
            ContentEncoding::TarGz => "tar.gz",
            ContentEncoding::Zip => "zip",
        }
    }
}

/// A component's content: either provided inline, or fetched from a URL
/// with a declared encoding (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentContent {
    Inline { content: String },
    Url { content_url: String, encoding: ContentEncoding },
}

/// A health-check configuration attached to a component (§3, §4.8, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckType {
    Http,
    Tcp,
    Process,
}

impl HealthCheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthCheckType::Http => "http",
            HealthCheckType::Tcp => "tcp",
            HealthCheckType::Process => "process",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<HealthCheckType> {
        match s {
            "http" => Some(HealthCheckType::Http),
            "tcp" => Some(HealthCheckType::Tcp),
            "process" => Some(HealthCheckType::Process),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub check_type: HealthCheckType,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u32,
    #[serde(default)]
    pub retries: u32,
}

fn default_interval_seconds() -> u32 {
    30
}

fn default_timeout_seconds() -> u32 {
    5
}

/// One component entry inside a submitted desired configuration (§3, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub name: String,
    pub kind: ComponentKind,
    pub hash: String,
    pub content: ComponentContent,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub handler: Option<Handler>,
    #[serde(default = "default_managed")]
    pub managed: bool,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
}

fn default_managed() -> bool {
    true
}

impl ComponentConfig {
    pub fn resolved_handler(&self) -> Handler {
        self.handler.unwrap_or_else(|| Handler::default_for(self.kind, self.managed))
    }
}

/// The opaque desired-configuration envelope submitted by a client (§3, §9).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DesiredConfiguration {
    pub components: Vec<ComponentConfig>,
}

/// Deployment lifecycle status (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Completed => "completed",
            DeploymentStatus::Failed => "failed",
        }
    }
}

/// Per-(component, node) deployment status (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentDeploymentStatus {
    Deploying,
    Running,
    Failed,
    Stopped,
}

impl ComponentDeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentDeploymentStatus::Deploying => "deploying",
            ComponentDeploymentStatus::Running => "running",
            ComponentDeploymentStatus::Failed => "failed",
            ComponentDeploymentStatus::Stopped => "stopped",
        }
    }
}

/// Health status as tracked on the controller's ComponentDeployment row (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }
}

/// Agent-local component run status (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Unknown,
    Running,
    Stopped,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Unknown => "unknown",
            RunStatus::Running => "running",
            RunStatus::Stopped => "stopped",
            RunStatus::Failed => "failed",
        }
    }

    pub fn from_str_loose(s: &str) -> RunStatus {
        match s {
            "running" => RunStatus::Running,
            "stopped" => RunStatus::Stopped,
            "failed" => RunStatus::Failed,
            _ => RunStatus::Unknown,
        }
    }
}

/// Last health-check result (§3, §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthResult {
    Success,
    Failure,
    Reset,
    Empty,
}

impl HealthResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthResult::Success => "success",
            HealthResult::Failure => "failure",
            HealthResult::Reset => "reset",
            HealthResult::Empty => "empty",
        }
    }
}

/// DeploymentResult operation kinds sent agent -> controller (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployOperation {
    Deploy,
    DeployProgram,
    DeployScript,
    Remove,
    Restart,
}

impl DeployOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployOperation::Deploy => "deploy",
            DeployOperation::DeployProgram => "deploy-program",
            DeployOperation::DeployScript => "deploy-script",
            DeployOperation::Remove => "remove",
            DeployOperation::Restart => "restart",
        }
    }
}

/// DeploymentResult outcome kinds (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployOutcome {
    Received,
    Started,
    Running,
    Success,
    Failure,
}

impl DeployOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployOutcome::Received => "received",
            DeployOutcome::Started => "started",
            DeployOutcome::Running => "running",
            DeployOutcome::Success => "success",
            DeployOutcome::Failure => "failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_defaults_match_spec_table() {
        assert_eq!(Handler::default_for(ComponentKind::Script, true), Handler::Agent);
        assert_eq!(Handler::default_for(ComponentKind::Script, false), Handler::ExternalBulk);
        assert_eq!(Handler::default_for(ComponentKind::Program, true), Handler::Agent);
        assert_eq!(Handler::default_for(ComponentKind::Program, false), Handler::Agent);
        assert_eq!(Handler::default_for(ComponentKind::Service, true), Handler::ExternalOrchestrator);
    }

    #[test]
    fn resolved_handler_prefers_explicit_value() {
        let cfg = ComponentConfig {
            name: "c".into(),
            kind: ComponentKind::Script,
            hash: "h".into(),
            content: ComponentContent::Inline { content: "x".into() },
            tags: Default::default(),
            env: Default::default(),
            args: Default::default(),
            handler: Some(Handler::ExternalOrchestrator),
            managed: true,
            health_check: None,
        };
        assert_eq!(cfg.resolved_handler(), Handler::ExternalOrchestrator);
    }
}
