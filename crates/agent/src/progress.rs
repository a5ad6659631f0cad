//! Progress reporter abstraction (§9 "Cyclic reference between reconciler
//! and lifecycle engine").
//!
//! The lifecycle engine reports outward through this trait instead of
//! holding a back-pointer to the control session, so `lifecycle.rs` has
//! no dependency on `session.rs`.

use async_trait::async_trait;
use cosmos_common::proto::{ComponentStatus, DeploymentResult, HealthCheckResult};

#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report_deployment(&self, result: DeploymentResult);
    async fn report_status(&self, status: ComponentStatus);
    async fn report_health(&self, result: HealthCheckResult);
    async fn report_log_chunk(&self, component_name: &str, data: Vec<u8>, offset: i64);
}
