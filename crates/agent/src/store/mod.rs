pub mod models;
pub mod sqlite;

pub use models::*;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

/// The agent's local store (C2, §4.2). Per-host CRUD for Component,
/// ComponentStatus, HealthCheck; env/argv are serialized as opaque JSON.
/// Deleting a component cascades to its status and health check.
#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn upsert_component(&self, component: ComponentRow) -> anyhow::Result<()>;
    async fn get_component(&self, name: &str) -> anyhow::Result<Option<ComponentRow>>;
    async fn list_components(&self) -> anyhow::Result<Vec<ComponentRow>>;
    async fn delete_component(&self, name: &str) -> anyhow::Result<()>;

    /// A missing component synthesizes `{status: unknown, last_checked_at: now}`
    /// rather than erroring (§4.2).
    async fn get_component_status(&self, name: &str) -> anyhow::Result<ComponentStatusRow>;
    async fn upsert_component_status(&self, status: ComponentStatusRow) -> anyhow::Result<()>;

    /// A missing health check returns `None` ("no check") rather than an
    /// error (§4.2).
    async fn get_health_check(&self, name: &str) -> anyhow::Result<Option<HealthCheckRow>>;
    async fn upsert_health_check(&self, check: HealthCheckRow) -> anyhow::Result<()>;
    async fn delete_health_check(&self, name: &str) -> anyhow::Result<()>;
    async fn list_health_checks(&self) -> anyhow::Result<Vec<HealthCheckRow>>;

    async fn append_log(&self, entry: NewDeploymentLogEntry) -> anyhow::Result<()>;
}
