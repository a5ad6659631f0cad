mod mock;
pub mod models;
pub mod postgres;

pub use mock::MockStore;
pub use models::*;
pub use postgres::PostgresStore;

use async_trait::async_trait;

/// The controller's durable store (C1, §4.1). A spec-compliant
/// implementation may choose any backing technology satisfying this
/// interface; we ship a `sqlx`/Postgres implementation plus an
/// in-memory one used by the planner's unit tests.
#[async_trait]
pub trait ControllerStore: Send + Sync {
    async fn create_deployment(&self, configuration_json: String) -> anyhow::Result<Deployment>;
    async fn update_deployment_status(
        &self,
        id: uuid::Uuid,
        status: cosmos_common::DeploymentStatus,
        error_message: Option<String>,
    ) -> anyhow::Result<()>;
    async fn list_deployments(&self, limit: i64, offset: i64) -> anyhow::Result<Vec<Deployment>>;
    async fn get_deployment(&self, id: uuid::Uuid) -> anyhow::Result<Option<Deployment>>;

    async fn append_deployment_log(&self, entry: NewDeploymentLogEntry) -> anyhow::Result<()>;

    async fn upsert_component(&self, component: ComponentRow) -> anyhow::Result<()>;
    async fn get_component(&self, name: &str) -> anyhow::Result<Option<ComponentRow>>;
    async fn list_components(&self) -> anyhow::Result<Vec<ComponentRow>>;
    async fn delete_component(&self, name: &str) -> anyhow::Result<()>;

    async fn upsert_component_deployment(&self, row: ComponentDeploymentRow) -> anyhow::Result<()>;
    async fn delete_component_deployments(&self, component_name: &str, hostnames: &[String]) -> anyhow::Result<()>;
    async fn list_component_deployments_by_component(&self, component_name: &str) -> anyhow::Result<Vec<ComponentDeploymentRow>>;
    async fn list_component_deployments_by_node(&self, hostname: &str) -> anyhow::Result<Vec<ComponentDeploymentRow>>;

    async fn upsert_agent(&self, agent: AgentRow) -> anyhow::Result<()>;
    async fn list_agents(&self) -> anyhow::Result<Vec<AgentRow>>;
    /// Mark agents whose last heartbeat predates the cutoff offline.
    /// Monotonic: only ever flips `online` from true to false.
    async fn mark_stale_agents_offline(&self, cutoff: chrono::DateTime<chrono::Utc>) -> anyhow::Result<u64>;

    async fn upsert_node(&self, node: NodeRow) -> anyhow::Result<()>;
    async fn list_nodes(&self, online_only: bool) -> anyhow::Result<Vec<NodeRow>>;
    async fn list_nodes_by_tags(&self, tags: &[String]) -> anyhow::Result<Vec<NodeRow>>;

    async fn cleanup_deployments_older_than(&self, cutoff: chrono::DateTime<chrono::Utc>) -> anyhow::Result<u64>;
}
