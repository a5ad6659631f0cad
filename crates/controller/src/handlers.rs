//! Handler polymorphism (§4.5 step 4, §9 "Handler polymorphism").
//!
//! Three concrete dispatchers behind one `ComponentHandler` trait; the
//! planner's tagged dispatch picks one per component based on its
//! resolved `Handler`. `ExternalBulkHandler`/`ExternalOrchestratorHandler`
//! are thin stubs: the calling convention (POST/DELETE to a configured
//! base URL) is implemented, the receiving systems are out of scope.

use std::sync::Arc;

use async_trait::async_trait;
use cosmos_common::proto::{self, ControllerMessage};
use cosmos_common::{ComponentConfig, ComponentContent, ComponentKind};
use tracing::warn;
use uuid::Uuid;

use crate::placement;
use crate::registry::StreamRegistry;
use crate::store::{ComponentDeploymentRow, ControllerStore, NewDeploymentLogEntry};

pub struct HandlerContext {
    pub store: Arc<dyn ControllerStore>,
    pub registry: Arc<StreamRegistry>,
    pub http: reqwest::Client,
    pub external_bulk_dispatcher_url: Option<String>,
    pub external_orchestrator_url: Option<String>,
}

#[async_trait]
pub trait ComponentHandler: Send + Sync {
    async fn deploy(&self, ctx: &HandlerContext, deployment_id: Uuid, config: &ComponentConfig) -> anyhow::Result<()>;
    async fn remove(&self, ctx: &HandlerContext, deployment_id: Uuid, name: &str) -> anyhow::Result<()>;
}

/// Converts a component config into the wire `ComponentDeployment`
/// command sent over C6 (§6).
fn to_proto_deployment(config: &ComponentConfig) -> proto::ComponentDeployment {
    let (content_url, content_url_encoding, content) = match &config.content {
        ComponentContent::Inline { content } => (String::new(), String::new(), content.clone().into_bytes()),
        ComponentContent::Url { content_url, encoding } => {
            (content_url.clone(), encoding.as_str().to_string(), Vec::new())
        }
    };
    proto::ComponentDeployment {
        component_name: config.name.clone(),
        component_type: config.kind.as_str().to_string(),
        hash: config.hash.clone(),
        content_url,
        content_url_encoding,
        content,
        managed: config.managed,
        env: config.env.clone().into_iter().collect(),
        args: config.args.clone(),
        health_check: config.health_check.as_ref().map(|hc| proto::HealthCheckConfig {
            component_name: config.name.clone(),
            r#type: hc.check_type.as_str().to_string(),
            endpoint: hc.endpoint.clone(),
            interval_seconds: hc.interval_seconds as i32,
            timeout_seconds: hc.timeout_seconds as i32,
            retries: hc.retries as i32,
        }),
    }
}

/// Builds the persisted `ComponentRow` for a desired-config entry.
pub fn to_component_row(deployment_id: Uuid, config: &ComponentConfig) -> crate::store::ComponentRow {
    let content_json = serde_json::to_string(&config.content).unwrap_or_default();
    crate::store::ComponentRow {
        name: config.name.clone(),
        kind: config.kind.as_str().to_string(),
        hash: config.hash.clone(),
        tags_json: serde_json::to_string(&config.tags).unwrap_or_default(),
        content_json,
        env_json: serde_json::to_string(&config.env).unwrap_or_default(),
        args_json: serde_json::to_string(&config.args).unwrap_or_default(),
        handler: config.resolved_handler().as_str().to_string(),
        managed: config.managed,
        health_check_json: config.health_check.as_ref().map(|hc| serde_json::to_string(hc).unwrap_or_default()),
        deployment_id,
        updated_at: chrono::Utc::now(),
    }
}

/// handler = agent: in-supervisor deployment (§4.5 step 4 "agent").
pub struct AgentHandler;

#[async_trait]
impl ComponentHandler for AgentHandler {
    async fn deploy(&self, ctx: &HandlerContext, deployment_id: Uuid, config: &ComponentConfig) -> anyhow::Result<()> {
        ctx.store.upsert_component(to_component_row(deployment_id, config)).await?;

        let targets = placement::resolve(&ctx.store, &config.tags).await?;
        if targets.is_empty() {
            ctx.store
                .append_deployment_log(NewDeploymentLogEntry {
                    deployment_id,
                    component_name: Some(config.name.clone()),
                    node_hostname: None,
                    operation: "deploy".into(),
                    status: "failure".into(),
                    message: Some("no eligible nodes".into()),
                })
                .await?;
            return Ok(());
        }

        // Pre-create rule: the `deploying` row must exist before the
        // stream send (§4.5 "Pre-create ordering").
        for hostname in &targets {
            ctx.store
                .upsert_component_deployment(ComponentDeploymentRow::new(config.name.clone(), hostname.clone()))
                .await?;
            ctx.store
                .append_deployment_log(NewDeploymentLogEntry {
                    deployment_id,
                    component_name: Some(config.name.clone()),
                    node_hostname: Some(hostname.clone()),
                    operation: "deploy".into(),
                    status: "sent".into(),
                    message: None,
                })
                .await?;
        }

        let message = ControllerMessage {
            payload: Some(proto::controller_message::Payload::ComponentDeployment(to_proto_deployment(config))),
        };
        let failures = ctx.registry.broadcast(&targets, message).await;
        for hostname in failures {
            warn!(component = %config.name, hostname, "deployment broadcast had no live stream");
            ctx.store
                .append_deployment_log(NewDeploymentLogEntry {
                    deployment_id,
                    component_name: Some(config.name.clone()),
                    node_hostname: Some(hostname),
                    operation: "deploy".into(),
                    status: "failure".into(),
                    message: Some("no stream for hostname".into()),
                })
                .await?;
        }
        Ok(())
    }

    async fn remove(&self, ctx: &HandlerContext, deployment_id: Uuid, name: &str) -> anyhow::Result<()> {
        let current = ctx.store.list_component_deployments_by_component(name).await?;
        let hostnames: Vec<String> = current.into_iter().map(|row| row.node_hostname).collect();

        if !hostnames.is_empty() {
            let message = ControllerMessage {
                payload: Some(proto::controller_message::Payload::ComponentRemoval(proto::ComponentRemoval {
                    component_name: name.to_string(),
                })),
            };
            let failures = ctx.registry.broadcast(&hostnames, message).await;
            for hostname in failures {
                ctx.store
                    .append_deployment_log(NewDeploymentLogEntry {
                        deployment_id,
                        component_name: Some(name.to_string()),
                        node_hostname: Some(hostname),
                        operation: "remove".into(),
                        status: "failure".into(),
                        message: Some("no stream for hostname".into()),
                    })
                    .await?;
            }
        }

        ctx.store.delete_component_deployments(name, &[]).await?;
        ctx.store.delete_component(name).await?;
        ctx.store
            .append_deployment_log(NewDeploymentLogEntry {
                deployment_id,
                component_name: Some(name.to_string()),
                node_hostname: None,
                operation: "remove".into(),
                status: "success".into(),
                message: None,
            })
            .await?;
        Ok(())
    }
}

/// handler = external-bulk: unmanaged scripts dispatched to an external
/// bulk-script dispatcher (§4.5 step 4, explicitly out of scope beyond
/// the calling convention).
pub struct ExternalBulkHandler;

#[async_trait]
impl ComponentHandler for ExternalBulkHandler {
    async fn deploy(&self, ctx: &HandlerContext, deployment_id: Uuid, config: &ComponentConfig) -> anyhow::Result<()> {
        debug_assert_eq!(config.kind, ComponentKind::Script);
        ctx.store.upsert_component(to_component_row(deployment_id, config)).await?;

        let (status, message) = match &ctx.external_bulk_dispatcher_url {
            Some(base_url) => match ctx
                .http
                .post(format!("{base_url}/scripts/{}", config.name))
                .json(&to_proto_deployment(config).content)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => ("success".to_string(), None),
                Ok(resp) => ("failure".to_string(), Some(format!("dispatcher returned {}", resp.status()))),
                Err(err) => ("failure".to_string(), Some(err.to_string())),
            },
            None => ("failure".to_string(), Some("no external bulk dispatcher configured".to_string())),
        };

        ctx.store
            .append_deployment_log(NewDeploymentLogEntry {
                deployment_id,
                component_name: Some(config.name.clone()),
                node_hostname: None,
                operation: "deploy".into(),
                status,
                message,
            })
            .await?;
        Ok(())
    }

    async fn remove(&self, ctx: &HandlerContext, deployment_id: Uuid, name: &str) -> anyhow::Result<()> {
        let (status, message) = match &ctx.external_bulk_dispatcher_url {
            Some(base_url) => match ctx.http.delete(format!("{base_url}/scripts/{name}")).send().await {
                Ok(resp) if resp.status().is_success() => ("success".to_string(), None),
                Ok(resp) => ("failure".to_string(), Some(format!("dispatcher returned {}", resp.status()))),
                Err(err) => ("failure".to_string(), Some(err.to_string())),
            },
            None => ("failure".to_string(), Some("no external bulk dispatcher configured".to_string())),
        };
        ctx.store.delete_component(name).await?;
        ctx.store
            .append_deployment_log(NewDeploymentLogEntry {
                deployment_id,
                component_name: Some(name.to_string()),
                node_hostname: None,
                operation: "remove".into(),
                status,
                message,
            })
            .await?;
        Ok(())
    }
}

/// handler = external-orchestrator: services dispatched to an external
/// orchestrator (§4.5 step 4).
pub struct ExternalOrchestratorHandler;

#[async_trait]
impl ComponentHandler for ExternalOrchestratorHandler {
    async fn deploy(&self, ctx: &HandlerContext, deployment_id: Uuid, config: &ComponentConfig) -> anyhow::Result<()> {
        debug_assert_eq!(config.kind, ComponentKind::Service);
        ctx.store.upsert_component(to_component_row(deployment_id, config)).await?;

        let (status, message) = match &ctx.external_orchestrator_url {
            Some(base_url) => match ctx
                .http
                .post(format!("{base_url}/services/{}", config.name))
                .json(&to_proto_deployment(config).content)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => ("success".to_string(), None),
                Ok(resp) => ("failure".to_string(), Some(format!("orchestrator returned {}", resp.status()))),
                Err(err) => ("failure".to_string(), Some(err.to_string())),
            },
            None => ("failure".to_string(), Some("no external orchestrator configured".to_string())),
        };

        ctx.store
            .append_deployment_log(NewDeploymentLogEntry {
                deployment_id,
                component_name: Some(config.name.clone()),
                node_hostname: None,
                operation: "deploy".into(),
                status,
                message,
            })
            .await?;
        Ok(())
    }

    async fn remove(&self, ctx: &HandlerContext, deployment_id: Uuid, name: &str) -> anyhow::Result<()> {
        let (status, message) = match &ctx.external_orchestrator_url {
            Some(base_url) => match ctx.http.delete(format!("{base_url}/services/{name}")).send().await {
                Ok(resp) if resp.status().is_success() => ("success".to_string(), None),
                Ok(resp) => ("failure".to_string(), Some(format!("orchestrator returned {}", resp.status()))),
                Err(err) => ("failure".to_string(), Some(err.to_string())),
            },
            None => ("failure".to_string(), Some("no external orchestrator configured".to_string())),
        };
        ctx.store.delete_component(name).await?;
        ctx.store
            .append_deployment_log(NewDeploymentLogEntry {
                deployment_id,
                component_name: Some(name.to_string()),
                node_hostname: None,
                operation: "remove".into(),
                status,
                message,
            })
            .await?;
        Ok(())
    }
}

pub fn for_handler(handler: cosmos_common::Handler) -> Arc<dyn ComponentHandler> {
    match handler {
        cosmos_common::Handler::Agent => Arc::new(AgentHandler),
        cosmos_common::Handler::ExternalBulk => Arc::new(ExternalBulkHandler),
        cosmos_common::Handler::ExternalOrchestrator => Arc::new(ExternalOrchestratorHandler),
    }
}
