//! `sqlx`/Postgres implementation of `ControllerStore` (§4.1, §6).
//!
//! Upserts key off the natural key named in the spec (component name,
//! agent hostname, node hostname, (component, node) pair) via
//! `ON CONFLICT ... DO UPDATE`, which gives us idempotency and
//! per-key write serialization from Postgres itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cosmos_common::DeploymentStatus;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use super::models::*;
use super::ControllerStore;

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl ControllerStore for PostgresStore {
    async fn create_deployment(&self, configuration_json: String) -> anyhow::Result<Deployment> {
        let id = Uuid::new_v4();
        let row = sqlx::query_as::<_, Deployment>(
            r#"INSERT INTO deployments (id, configuration_json, status)
               VALUES ($1, $2, 'pending')
               RETURNING id, configuration_json, status, error_message, created_at, started_at, completed_at"#,
        )
        .bind(id)
        .bind(configuration_json)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn update_deployment_status(
        &self,
        id: Uuid,
        status: DeploymentStatus,
        error_message: Option<String>,
    ) -> anyhow::Result<()> {
        match status {
            DeploymentStatus::Running => {
                sqlx::query(
                    "UPDATE deployments SET status = $1, error_message = $2, started_at = COALESCE(started_at, now()) WHERE id = $3",
                )
                .bind(status.as_str())
                .bind(&error_message)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
            DeploymentStatus::Completed | DeploymentStatus::Failed => {
                sqlx::query(
                    "UPDATE deployments SET status = $1, error_message = $2, completed_at = COALESCE(completed_at, now()) WHERE id = $3",
                )
                .bind(status.as_str())
                .bind(&error_message)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
            DeploymentStatus::Pending => {
                sqlx::query("UPDATE deployments SET status = $1, error_message = $2 WHERE id = $3")
                    .bind(status.as_str())
                    .bind(&error_message)
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn list_deployments(&self, limit: i64, offset: i64) -> anyhow::Result<Vec<Deployment>> {
        let rows = sqlx::query_as::<_, Deployment>(
            "SELECT id, configuration_json, status, error_message, created_at, started_at, completed_at
             FROM deployments ORDER BY created_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_deployment(&self, id: Uuid) -> anyhow::Result<Option<Deployment>> {
        let row = sqlx::query_as::<_, Deployment>(
            "SELECT id, configuration_json, status, error_message, created_at, started_at, completed_at
             FROM deployments WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn append_deployment_log(&self, entry: NewDeploymentLogEntry) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO deployment_log (deployment_id, component_name, node_hostname, operation, status, message)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(entry.deployment_id)
        .bind(&entry.component_name)
        .bind(&entry.node_hostname)
        .bind(&entry.operation)
        .bind(&entry.status)
        .bind(&entry.message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_component(&self, component: ComponentRow) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO components
                 (name, kind, hash, tags_json, content_json, env_json, args_json, handler, managed, health_check_json, deployment_id, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, now())
               ON CONFLICT (name) DO UPDATE SET
                 kind = EXCLUDED.kind,
                 hash = EXCLUDED.hash,
                 tags_json = EXCLUDED.tags_json,
                 content_json = EXCLUDED.content_json,
                 env_json = EXCLUDED.env_json,
                 args_json = EXCLUDED.args_json,
                 handler = EXCLUDED.handler,
                 managed = EXCLUDED.managed,
                 health_check_json = EXCLUDED.health_check_json,
                 deployment_id = EXCLUDED.deployment_id,
                 updated_at = now()"#,
        )
        .bind(&component.name)
        .bind(&component.kind)
        .bind(&component.hash)
        .bind(&component.tags_json)
        .bind(&component.content_json)
        .bind(&component.env_json)
        .bind(&component.args_json)
        .bind(&component.handler)
        .bind(component.managed)
        .bind(&component.health_check_json)
        .bind(component.deployment_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_component(&self, name: &str) -> anyhow::Result<Option<ComponentRow>> {
        let row = sqlx::query_as::<_, ComponentRow>("SELECT * FROM components WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_components(&self) -> anyhow::Result<Vec<ComponentRow>> {
        let rows = sqlx::query_as::<_, ComponentRow>("SELECT * FROM components")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn delete_component(&self, name: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM components WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_component_deployment(&self, row: ComponentDeploymentRow) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO component_deployments
                 (component_name, node_hostname, status, message, pid, health_status, last_started_at, last_health_check, deployed_at, last_updated)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now())
               ON CONFLICT (component_name, node_hostname) DO UPDATE SET
                 status = EXCLUDED.status,
                 message = EXCLUDED.message,
                 pid = EXCLUDED.pid,
                 health_status = EXCLUDED.health_status,
                 last_started_at = EXCLUDED.last_started_at,
                 last_health_check = EXCLUDED.last_health_check,
                 last_updated = now()"#,
        )
        .bind(&row.component_name)
        .bind(&row.node_hostname)
        .bind(&row.status)
        .bind(&row.message)
        .bind(row.pid)
        .bind(&row.health_status)
        .bind(row.last_started_at)
        .bind(row.last_health_check)
        .bind(row.deployed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_component_deployments(&self, component_name: &str, hostnames: &[String]) -> anyhow::Result<()> {
        if hostnames.is_empty() {
            sqlx::query("DELETE FROM component_deployments WHERE component_name = $1")
                .bind(component_name)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query("DELETE FROM component_deployments WHERE component_name = $1 AND node_hostname = ANY($2)")
                .bind(component_name)
                .bind(hostnames)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn list_component_deployments_by_component(&self, component_name: &str) -> anyhow::Result<Vec<ComponentDeploymentRow>> {
        let rows = sqlx::query_as::<_, ComponentDeploymentRow>(
            "SELECT * FROM component_deployments WHERE component_name = $1",
        )
        .bind(component_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_component_deployments_by_node(&self, hostname: &str) -> anyhow::Result<Vec<ComponentDeploymentRow>> {
        let rows = sqlx::query_as::<_, ComponentDeploymentRow>(
            "SELECT * FROM component_deployments WHERE node_hostname = $1",
        )
        .bind(hostname)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn upsert_agent(&self, agent: AgentRow) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO agents (hostname, version, last_heartbeat, online, component_count)
               VALUES ($1, $2, $3, true, $4)
               ON CONFLICT (hostname) DO UPDATE SET
                 version = EXCLUDED.version,
                 last_heartbeat = EXCLUDED.last_heartbeat,
                 online = true,
                 component_count = EXCLUDED.component_count"#,
        )
        .bind(&agent.hostname)
        .bind(&agent.version)
        .bind(agent.last_heartbeat)
        .bind(agent.component_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_agents(&self) -> anyhow::Result<Vec<AgentRow>> {
        let rows = sqlx::query_as::<_, AgentRow>("SELECT * FROM agents").fetch_all(&self.pool).await?;
        Ok(rows)
    }

    async fn mark_stale_agents_offline(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE agents SET online = false WHERE online = true AND last_heartbeat < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_node(&self, node: NodeRow) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO nodes (hostname, ip, tags_json, online, has_agent, last_seen)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (hostname) DO UPDATE SET
                 ip = EXCLUDED.ip,
                 tags_json = EXCLUDED.tags_json,
                 online = EXCLUDED.online,
                 has_agent = EXCLUDED.has_agent,
                 last_seen = EXCLUDED.last_seen"#,
        )
        .bind(&node.hostname)
        .bind(&node.ip)
        .bind(&node.tags_json)
        .bind(node.online)
        .bind(node.has_agent)
        .bind(node.last_seen)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_nodes(&self, online_only: bool) -> anyhow::Result<Vec<NodeRow>> {
        let rows = if online_only {
            sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE online = true")
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes").fetch_all(&self.pool).await?
        };
        Ok(rows)
    }

    async fn list_nodes_by_tags(&self, tags: &[String]) -> anyhow::Result<Vec<NodeRow>> {
        if tags.is_empty() {
            return self.list_nodes(false).await;
        }
        // tags_json is a JSON array column; `?|` checks array-string overlap.
        let rows = sqlx::query_as::<_, NodeRow>(
            "SELECT * FROM nodes WHERE tags_json::jsonb ?| $1",
        )
        .bind(tags)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn cleanup_deployments_older_than(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "DELETE FROM deployments WHERE status IN ('completed', 'failed') AND created_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
