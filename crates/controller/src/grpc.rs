//! Server side of the bidirectional streaming control protocol (C6, §6).
//!
//! One `Connect` method: the agent dials in with a stream of
//! `AgentMessage`s and receives a stream of `ControllerMessage`s back.
//! The controller identifies the peer from the first message's
//! hostname field (TLS client-cert CN would take priority when mutual
//! TLS is configured; see the module-level note below) and registers
//! the stream under that hostname (§4.6).

use std::pin::Pin;
use std::sync::Arc;

use cosmos_common::proto::control_plane_server::ControlPlane;
use cosmos_common::proto::{
    agent_message, AgentMessage, ControllerMessage, SubmitDeploymentRequest, SubmitDeploymentResponse,
};
use cosmos_common::{ComponentDeploymentStatus, DesiredConfiguration, HealthResult, HealthStatus};
use futures::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

use crate::planner::Planner;
use crate::registry::StreamRegistry;
use crate::store::{ComponentDeploymentRow, ControllerStore};

pub struct ControlPlaneService {
    pub store: Arc<dyn ControllerStore>,
    pub registry: Arc<StreamRegistry>,
    pub planner: Arc<Planner>,
}

#[tonic::async_trait]
impl ControlPlane for ControlPlaneService {
    type ConnectStream = Pin<Box<dyn Stream<Item = Result<ControllerMessage, Status>> + Send + 'static>>;

    async fn connect(&self, request: Request<Streaming<AgentMessage>>) -> Result<Response<Self::ConnectStream>, Status> {
        let mut inbound = request.into_inner();

        // Identification: TLS is optional in this environment's tonic
        // build; when absent, the first Heartbeat (or any message)
        // carrying a hostname identifies the peer (§4.6, §6 "Transport").
        let first = match inbound.message().await? {
            Some(msg) => msg,
            None => return Err(Status::invalid_argument("stream closed before identification")),
        };
        if first.hostname.is_empty() {
            return Err(Status::invalid_argument("first message must carry a hostname"));
        }
        let hostname = first.hostname.clone();

        let outbound_rx = self.registry.register(&hostname).await;
        let owned_sender = self.registry.get(&hostname).await.expect("just registered");

        handle_inbound(&self.store, &hostname, first).await;

        let store = self.store.clone();
        let registry = self.registry.clone();
        let hostname_for_task = hostname.clone();
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(msg)) => handle_inbound(&store, &hostname_for_task, msg).await,
                    Ok(None) => {
                        debug!(hostname = %hostname_for_task, "agent stream closed (EOF)");
                        break;
                    }
                    Err(status) => {
                        debug!(hostname = %hostname_for_task, %status, "agent stream closed (error)");
                        break;
                    }
                }
            }
            registry.deregister(&hostname_for_task, &owned_sender).await;
        });

        let outbound = ReceiverStream::new(outbound_rx).map(Ok);
        Ok(Response::new(Box::pin(outbound) as Self::ConnectStream))
    }

    async fn submit_deployment(
        &self,
        request: Request<SubmitDeploymentRequest>,
    ) -> Result<Response<SubmitDeploymentResponse>, Status> {
        let req = request.into_inner();
        let desired: DesiredConfiguration = serde_json::from_str(&req.configuration_json)
            .map_err(|err| Status::invalid_argument(format!("invalid configuration: {err}")))?;

        let deployment = self
            .store
            .create_deployment(req.configuration_json)
            .await
            .map_err(|err| Status::internal(err.to_string()))?;

        let planner = self.planner.clone();
        let deployment_id = deployment.id;
        tokio::spawn(async move { planner.process_deployment(deployment_id, desired).await });

        Ok(Response::new(SubmitDeploymentResponse { deployment_id: deployment.id.to_string() }))
    }
}

async fn handle_inbound(store: &Arc<dyn ControllerStore>, hostname: &str, msg: AgentMessage) {
    let Some(payload) = msg.payload else {
        warn!(hostname, "agent message with no payload, ignoring");
        return;
    };

    match payload {
        agent_message::Payload::Heartbeat(hb) => {
            if let Err(err) = store
                .upsert_agent(crate::store::AgentRow {
                    hostname: hostname.to_string(),
                    version: hb.agent_version,
                    last_heartbeat: chrono::Utc::now(),
                    online: true,
                    component_count: hb.component_statuses.len() as i64,
                })
                .await
            {
                warn!(hostname, %err, "failed to upsert agent heartbeat");
            }
            for status in hb.component_statuses {
                apply_component_status(store, hostname, status).await;
            }
        }
        agent_message::Payload::ComponentStatus(status) => {
            apply_component_status(store, hostname, status).await;
        }
        agent_message::Payload::HealthCheckResult(result) => {
            apply_health_result(store, hostname, result).await;
        }
        agent_message::Payload::DeploymentResult(result) => {
            apply_deployment_result(store, hostname, result).await;
        }
        agent_message::Payload::LogChunk(chunk) => {
            debug!(hostname, component = %chunk.component_name, offset = chunk.offset, "log chunk received");
        }
    }
}

async fn apply_component_status(
    store: &Arc<dyn ControllerStore>,
    hostname: &str,
    status: cosmos_common::proto::ComponentStatus,
) {
    let mut row = store
        .list_component_deployments_by_component(&status.name)
        .await
        .ok()
        .and_then(|rows| rows.into_iter().find(|r| r.node_hostname == hostname))
        .unwrap_or_else(|| ComponentDeploymentRow::new(status.name.clone(), hostname.to_string()));

    row.status = run_status_to_component_deployment_status(&status.status).as_str().to_string();
    row.message = Some(status.message);
    row.pid = if status.pid > 0 { Some(status.pid) } else { None };
    row.last_started_at = status
        .last_started_at
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0));
    row.last_updated = chrono::Utc::now();

    if let Err(err) = store.upsert_component_deployment(row).await {
        warn!(hostname, component = %status.name, %err, "failed to apply component status");
    }
}

fn run_status_to_component_deployment_status(status: &str) -> ComponentDeploymentStatus {
    match status {
        "running" => ComponentDeploymentStatus::Running,
        "stopped" => ComponentDeploymentStatus::Stopped,
        "failed" => ComponentDeploymentStatus::Failed,
        _ => ComponentDeploymentStatus::Deploying,
    }
}

async fn apply_health_result(
    store: &Arc<dyn ControllerStore>,
    hostname: &str,
    result: cosmos_common::proto::HealthCheckResult,
) {
    let mut row = match store
        .list_component_deployments_by_component(&result.component_name)
        .await
        .ok()
        .and_then(|rows| rows.into_iter().find(|r| r.node_hostname == hostname))
    {
        Some(row) => row,
        None => return,
    };

    row.health_status = if result.result == HealthResult::Success.as_str() {
        HealthStatus::Healthy.as_str().to_string()
    } else {
        HealthStatus::Unhealthy.as_str().to_string()
    };
    row.last_health_check = Some(chrono::Utc::now());
    row.last_updated = chrono::Utc::now();

    if let Err(err) = store.upsert_component_deployment(row).await {
        warn!(hostname, component = %result.component_name, %err, "failed to apply health check result");
    }
}

async fn apply_deployment_result(
    store: &Arc<dyn ControllerStore>,
    hostname: &str,
    result: cosmos_common::proto::DeploymentResult,
) {
    let deployment_id = match store.get_component(&result.component_name).await {
        Ok(Some(component)) => component.deployment_id,
        _ => {
            debug!(hostname, component = %result.component_name, "deployment result for unknown component, logging without deployment id skipped");
            return;
        }
    };

    let component_name = result.component_name.clone();

    // The agent follows a success/failure DeploymentResult with an
    // explicit ComponentStatus carrying the real PID (§4.7 "Deployment
    // inbound handling"); this handler only records the log entry, so
    // it never clobbers a PID the next ComponentStatus is about to set.
    if let Err(err) = store
        .append_deployment_log(crate::store::NewDeploymentLogEntry {
            deployment_id,
            component_name: Some(component_name.clone()),
            node_hostname: Some(hostname.to_string()),
            operation: result.operation,
            status: result.result,
            message: Some(result.message),
        })
        .await
    {
        warn!(hostname, component = %component_name, %err, "failed to append deployment log");
    }
}
