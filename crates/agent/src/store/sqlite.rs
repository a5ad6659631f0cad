//! `sqlx`/SQLite implementation of `AgentStore` (§4.2, §6 "agent.db").
//!
//! A single-connection pool is sufficient and serializes writes per §5.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use super::models::*;
use super::AgentStore;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(path: &str) -> anyhow::Result<Self> {
        let url = format!("sqlite://{path}?mode=rwc");
        let pool = SqlitePoolOptions::new().max_connections(1).connect(&url).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn connect_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new().max_connections(1).connect("sqlite::memory:").await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl AgentStore for SqliteStore {
    async fn upsert_component(&self, component: ComponentRow) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO components (name, kind, hash, source_url, encoding, content_inline, executable_path, env_json, args_json, managed)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(name) DO UPDATE SET
                 kind = excluded.kind,
                 hash = excluded.hash,
                 source_url = excluded.source_url,
                 encoding = excluded.encoding,
                 content_inline = excluded.content_inline,
                 executable_path = excluded.executable_path,
                 env_json = excluded.env_json,
                 args_json = excluded.args_json,
                 managed = excluded.managed"#,
        )
        .bind(&component.name)
        .bind(&component.kind)
        .bind(&component.hash)
        .bind(&component.source_url)
        .bind(&component.encoding)
        .bind(&component.content_inline)
        .bind(&component.executable_path)
        .bind(&component.env_json)
        .bind(&component.args_json)
        .bind(component.managed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_component(&self, name: &str) -> anyhow::Result<Option<ComponentRow>> {
        let row = sqlx::query_as::<_, ComponentRow>("SELECT * FROM components WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_components(&self) -> anyhow::Result<Vec<ComponentRow>> {
        let rows = sqlx::query_as::<_, ComponentRow>("SELECT * FROM components").fetch_all(&self.pool).await?;
        Ok(rows)
    }

    async fn delete_component(&self, name: &str) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM components WHERE name = ?").bind(name).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM component_status WHERE name = ?").bind(name).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM health_checks WHERE name = ?").bind(name).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_component_status(&self, name: &str) -> anyhow::Result<ComponentStatusRow> {
        let row = sqlx::query_as::<_, ComponentStatusRow>("SELECT * FROM component_status WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.unwrap_or_else(|| ComponentStatusRow::default_for(name)))
    }

    async fn upsert_component_status(&self, status: ComponentStatusRow) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO component_status (name, status, message, pid, restart_count, last_started_at, last_checked_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(name) DO UPDATE SET
                 status = excluded.status,
                 message = excluded.message,
                 pid = excluded.pid,
                 restart_count = excluded.restart_count,
                 last_started_at = excluded.last_started_at,
                 last_checked_at = excluded.last_checked_at"#,
        )
        .bind(&status.name)
        .bind(&status.status)
        .bind(&status.message)
        .bind(status.pid)
        .bind(status.restart_count)
        .bind(status.last_started_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_health_check(&self, name: &str) -> anyhow::Result<Option<HealthCheckRow>> {
        let row = sqlx::query_as::<_, HealthCheckRow>("SELECT * FROM health_checks WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn upsert_health_check(&self, check: HealthCheckRow) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO health_checks (name, check_type, endpoint, interval_seconds, timeout_seconds, retries, last_check_at, last_result, consecutive_failures)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(name) DO UPDATE SET
                 check_type = excluded.check_type,
                 endpoint = excluded.endpoint,
                 interval_seconds = excluded.interval_seconds,
                 timeout_seconds = excluded.timeout_seconds,
                 retries = excluded.retries,
                 last_check_at = excluded.last_check_at,
                 last_result = excluded.last_result,
                 consecutive_failures = excluded.consecutive_failures"#,
        )
        .bind(&check.name)
        .bind(&check.check_type)
        .bind(&check.endpoint)
        .bind(check.interval_seconds)
        .bind(check.timeout_seconds)
        .bind(check.retries)
        .bind(check.last_check_at)
        .bind(&check.last_result)
        .bind(check.consecutive_failures)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_health_check(&self, name: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM health_checks WHERE name = ?").bind(name).execute(&self.pool).await?;
        Ok(())
    }

    async fn list_health_checks(&self) -> anyhow::Result<Vec<HealthCheckRow>> {
        let rows = sqlx::query_as::<_, HealthCheckRow>("SELECT * FROM health_checks").fetch_all(&self.pool).await?;
        Ok(rows)
    }

    async fn append_log(&self, entry: NewDeploymentLogEntry) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO deployment_log (component_name, operation, status, message) VALUES (?, ?, ?, ?)")
            .bind(&entry.component_name)
            .bind(&entry.operation)
            .bind(&entry.status)
            .bind(&entry.message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_component_status_synthesizes_default() {
        let store = SqliteStore::connect_memory().await.unwrap();
        let status = store.get_component_status("ghost").await.unwrap();
        assert_eq!(status.status, "unknown");
    }

    #[tokio::test]
    async fn missing_health_check_returns_none() {
        let store = SqliteStore::connect_memory().await.unwrap();
        assert!(store.get_health_check("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_component_cascades() {
        let store = SqliteStore::connect_memory().await.unwrap();
        store
            .upsert_component(ComponentRow {
                name: "c".into(),
                kind: "script".into(),
                hash: "h".into(),
                source_url: None,
                encoding: None,
                content_inline: None,
                executable_path: None,
                env_json: "{}".into(),
                args_json: "[]".into(),
                managed: true,
            })
            .await
            .unwrap();
        store.upsert_component_status(ComponentStatusRow::default_for("c")).await.unwrap();
        store
            .upsert_health_check(HealthCheckRow {
                name: "c".into(),
                check_type: "tcp".into(),
                endpoint: "localhost:1".into(),
                interval_seconds: 30,
                timeout_seconds: 5,
                retries: 3,
                last_check_at: None,
                last_result: "empty".into(),
                consecutive_failures: 0,
            })
            .await
            .unwrap();

        store.delete_component("c").await.unwrap();
        assert!(store.get_component("c").await.unwrap().is_none());
        assert!(store.get_health_check("c").await.unwrap().is_none());
        let status = store.get_component_status("c").await.unwrap();
        assert_eq!(status.status, "unknown");
    }
}
