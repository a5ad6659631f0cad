//! Reconciler + heartbeat loops (§4.7 "Reconciler loop on agent" /
//! "Heartbeat loop on agent") and inbound command dispatch (§4.6).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cosmos_common::proto::{controller_message, ComponentStatus as ProtoComponentStatus, DeploymentResult, Heartbeat, HealthCheckResult};
use cosmos_common::RunStatus;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::health::HealthChecker;
use crate::lifecycle::{is_process_alive, LifecycleEngine};
use crate::progress::ProgressReporter;
use crate::session::ControlSession;
use crate::store::{AgentStore, HealthCheckRow};

pub struct Reconciler {
    store: Arc<dyn AgentStore>,
    lifecycle: Arc<LifecycleEngine>,
    health: Arc<HealthChecker>,
    session: Arc<ControlSession>,
    reconcile_interval: Duration,
    heartbeat_interval: Duration,
    agent_version: String,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn AgentStore>,
        lifecycle: Arc<LifecycleEngine>,
        health: Arc<HealthChecker>,
        session: Arc<ControlSession>,
        reconcile_interval: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            store,
            lifecycle,
            health,
            session,
            reconcile_interval,
            heartbeat_interval,
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Spawns the inbound dispatcher, reconciler loop, and heartbeat loop
    /// as independent background tasks (§5 "Scheduling model").
    pub fn start(self: &Arc<Self>, inbound_rx: mpsc::Receiver<cosmos_common::proto::ControllerMessage>) {
        let this = self.clone();
        tokio::spawn(async move { this.run_inbound(inbound_rx).await });

        let this = self.clone();
        tokio::spawn(async move { this.run_reconcile_loop().await });

        let this = self.clone();
        tokio::spawn(async move { this.run_heartbeat_loop().await });
    }

    /// Inbound commands are processed one at a time from the channel,
    /// which is the serialization point per §5 "Ordering guarantees".
    async fn run_inbound(&self, mut inbound_rx: mpsc::Receiver<cosmos_common::proto::ControllerMessage>) {
        while let Some(message) = inbound_rx.recv().await {
            match message.payload {
                Some(controller_message::Payload::ComponentDeployment(cmd)) => {
                    self.lifecycle.handle_deployment(cmd).await;
                }
                Some(controller_message::Payload::ComponentRemoval(cmd)) => {
                    self.lifecycle.handle_removal(&cmd.component_name).await;
                }
                Some(controller_message::Payload::HealthCheckConfig(cfg)) => {
                    if let Err(err) = self.apply_health_check_config(cfg).await {
                        warn!(%err, "failed to apply health check config update");
                    }
                }
                Some(controller_message::Payload::Acknowledgment(ack)) => {
                    debug!(message_id = %ack.message_id, "received acknowledgment");
                }
                None => {}
            }
        }
    }

    async fn apply_health_check_config(&self, cfg: cosmos_common::proto::HealthCheckConfig) -> anyhow::Result<()> {
        let existing = self.store.get_health_check(&cfg.component_name).await?;
        let row = HealthCheckRow {
            name: cfg.component_name,
            check_type: cfg.r#type,
            endpoint: cfg.endpoint,
            interval_seconds: cfg.interval_seconds as i64,
            timeout_seconds: cfg.timeout_seconds as i64,
            retries: cfg.retries as i64,
            last_check_at: existing.as_ref().and_then(|e| e.last_check_at),
            last_result: existing.map(|e| e.last_result).unwrap_or_else(|| "empty".to_string()),
            consecutive_failures: 0,
        };
        self.store.upsert_health_check(row).await
    }

    async fn run_reconcile_loop(&self) {
        let mut ticker = tokio::time::interval(self.reconcile_interval);
        loop {
            ticker.tick().await;
            if let Err(err) = self.reconcile_tick().await {
                warn!(%err, "reconcile tick failed");
            }
        }
    }

    async fn reconcile_tick(&self) -> anyhow::Result<()> {
        let components = self.store.list_components().await?;

        // 1. detect managed components that died without us noticing.
        for component in &components {
            if !component.managed {
                continue;
            }
            let mut status = self.store.get_component_status(&component.name).await?;
            if status.run_status() != RunStatus::Running {
                continue;
            }
            let Some(pid) = status.pid else { continue };
            if pid > 0 && !is_process_alive(pid) {
                status.status = RunStatus::Stopped.as_str().to_string();
                status.message = "Process died unexpectedly".to_string();
                status.pid = None;
                status.last_checked_at = Utc::now();
                self.store.upsert_component_status(status.clone()).await?;
                self.session.report_status(to_proto_status(&status)).await;
            }
        }

        // 2. restart managed components that are down.
        for component in &components {
            if !component.managed {
                continue;
            }
            let status = self.store.get_component_status(&component.name).await?;
            if !matches!(status.run_status(), RunStatus::Stopped | RunStatus::Failed) {
                continue;
            }
            let (result, message) = match self.lifecycle.restart(&component.name).await {
                Ok(()) => ("success", String::new()),
                Err(err) => ("failure", err.to_string()),
            };
            self.session
                .report_deployment(DeploymentResult {
                    component_name: component.name.clone(),
                    operation: "restart".to_string(),
                    result: result.to_string(),
                    message,
                    timestamp: Utc::now().timestamp(),
                })
                .await;
        }

        // 3. run due health checks, reporting every probed result so the
        // controller's view tracks recoveries as well as failures, then
        // flag any check past its retry budget with a dedicated message.
        for result in self.health.run_due_checks().await? {
            self.session.report_health(result).await;
        }
        for check in self.store.list_health_checks().await? {
            if check.retries > 0 && check.consecutive_failures >= check.retries {
                self.session
                    .report_health(HealthCheckResult {
                        component_name: check.name.clone(),
                        check_type: check.check_type.clone(),
                        result: "failure".to_string(),
                        message: format!("{} consecutive failures", check.consecutive_failures),
                        timestamp: Utc::now().timestamp(),
                    })
                    .await;
            }
        }

        Ok(())
    }

    async fn run_heartbeat_loop(&self) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        loop {
            ticker.tick().await;
            if let Err(err) = self.heartbeat_tick().await {
                warn!(%err, "heartbeat tick failed");
            }
        }
    }

    async fn heartbeat_tick(&self) -> anyhow::Result<()> {
        let mut statuses = Vec::new();
        for component in self.store.list_components().await? {
            let status = self.store.get_component_status(&component.name).await?;
            statuses.push(to_proto_status(&status));
        }
        self.session
            .send_heartbeat(Heartbeat { agent_version: self.agent_version.clone(), component_statuses: statuses })
            .await;
        Ok(())
    }
}

fn to_proto_status(row: &crate::store::ComponentStatusRow) -> ProtoComponentStatus {
    ProtoComponentStatus {
        name: row.name.clone(),
        status: row.status.clone(),
        message: row.message.clone(),
        pid: row.pid.unwrap_or(0),
        restart_count: row.restart_count as i32,
        last_started_at: row.last_started_at.map(|t| t.timestamp()),
    }
}
