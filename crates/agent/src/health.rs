//! Health checker (C8, §4.8) — http/tcp/process probes.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cosmos_common::proto::HealthCheckResult as ProtoHealthCheckResult;
use cosmos_common::{HealthCheckType, HealthResult};
use tracing::debug;

use crate::lifecycle::is_process_alive;
use crate::store::{AgentStore, ComponentStatusRow, HealthCheckRow};

const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HealthChecker {
    store: Arc<dyn AgentStore>,
    http: reqwest::Client,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn AgentStore>) -> Self {
        // Redirects are not followed (§4.8).
        let http = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none()).build().unwrap_or_default();
        Self { store, http }
    }

    /// Runs every due check and persists the updated counters, returning
    /// the checks that just failed so the caller can emit events.
    pub async fn run_due_checks(&self) -> anyhow::Result<Vec<ProtoHealthCheckResult>> {
        let now = Utc::now();
        let mut results = Vec::new();
        for check in self.store.list_health_checks().await? {
            if !check.is_due(now) {
                continue;
            }
            let outcome = self.probe(&check).await;
            let mut updated = check.clone();
            updated.last_check_at = Some(now);
            match outcome {
                HealthResult::Success => {
                    updated.consecutive_failures = 0;
                    updated.last_result = HealthResult::Success.as_str().to_string();
                }
                _ => {
                    updated.consecutive_failures += 1;
                    updated.last_result = HealthResult::Failure.as_str().to_string();
                }
            }
            self.store.upsert_health_check(updated.clone()).await?;

            results.push(ProtoHealthCheckResult {
                component_name: check.name.clone(),
                check_type: check.check_type.clone(),
                result: if matches!(outcome, HealthResult::Success) { "success" } else { "failure" }.to_string(),
                message: String::new(),
                timestamp: now.timestamp(),
            });
        }
        Ok(results)
    }

    async fn probe(&self, check: &HealthCheckRow) -> HealthResult {
        match check.check_type() {
            HealthCheckType::Http => self.probe_http(check).await,
            HealthCheckType::Tcp => self.probe_tcp(check).await,
            HealthCheckType::Process => self.probe_process(check).await,
        }
    }

    async fn probe_http(&self, check: &HealthCheckRow) -> HealthResult {
        let timeout = if check.timeout_seconds > 0 {
            Duration::from_secs(check.timeout_seconds as u64)
        } else {
            DEFAULT_HTTP_TIMEOUT
        };
        match self.http.get(&check.endpoint).timeout(timeout).send().await {
            Ok(response) if response.status().is_success() => HealthResult::Success,
            Ok(_) | Err(_) => HealthResult::Failure,
        }
    }

    async fn probe_tcp(&self, check: &HealthCheckRow) -> HealthResult {
        let timeout = if check.timeout_seconds > 0 {
            Duration::from_secs(check.timeout_seconds as u64)
        } else {
            DEFAULT_TCP_TIMEOUT
        };
        let endpoint = check.endpoint.clone();
        let dial = tokio::task::spawn_blocking(move || {
            let addr = endpoint.to_socket_addrs()?.next().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no address resolved")
            })?;
            std::net::TcpStream::connect_timeout(&addr, timeout)
        })
        .await;

        match dial {
            Ok(Ok(_)) => HealthResult::Success,
            Ok(Err(err)) => {
                debug!(endpoint = %check.endpoint, %err, "tcp health check failed");
                HealthResult::Failure
            }
            Err(err) => {
                debug!(%err, "tcp health check task panicked");
                HealthResult::Failure
            }
        }
    }

    async fn probe_process(&self, check: &HealthCheckRow) -> HealthResult {
        let status: ComponentStatusRow = match self.store.get_component_status(&check.name).await {
            Ok(status) => status,
            Err(_) => return HealthResult::Failure,
        };
        match status.pid {
            Some(pid) if pid > 0 && is_process_alive(pid) => HealthResult::Success,
            _ => HealthResult::Failure,
        }
    }

    /// `ResetFailureCount` (§4.8).
    pub async fn reset_failure_count(&self, name: &str) -> anyhow::Result<()> {
        if let Some(mut check) = self.store.get_health_check(name).await? {
            check.consecutive_failures = 0;
            check.last_result = HealthResult::Reset.as_str().to_string();
            self.store.upsert_health_check(check).await?;
        }
        Ok(())
    }
}
