//! Deployment planner / reconciler (C5, §4.5).

use std::collections::HashSet;
use std::sync::Arc;

use cosmos_common::{ComponentConfig, DeploymentStatus, DesiredConfiguration};
use futures::future::join_all;
use tracing::{error, info};
use uuid::Uuid;

use crate::handlers::{self, HandlerContext};
use crate::store::{ControllerStore, NewDeploymentLogEntry};

pub struct Planner {
    store: Arc<dyn ControllerStore>,
    handler_ctx: Arc<HandlerContext>,
}

impl Planner {
    pub fn new(store: Arc<dyn ControllerStore>, handler_ctx: Arc<HandlerContext>) -> Self {
        Self { store, handler_ctx }
    }

    /// `ProcessDeployment(deploymentId, desiredConfig)` (§4.5).
    pub async fn process_deployment(&self, deployment_id: Uuid, desired: DesiredConfiguration) {
        if let Err(err) = self
            .store
            .update_deployment_status(deployment_id, DeploymentStatus::Running, None)
            .await
        {
            error!(%deployment_id, %err, "failed to mark deployment running");
            return;
        }

        match self.diff_and_dispatch(deployment_id, desired).await {
            Ok(()) => {
                if let Err(err) = self
                    .store
                    .update_deployment_status(deployment_id, DeploymentStatus::Completed, None)
                    .await
                {
                    error!(%deployment_id, %err, "failed to mark deployment completed");
                }
            }
            Err(err) => {
                error!(%deployment_id, %err, "planner error, marking deployment failed");
                let _ = self
                    .store
                    .update_deployment_status(deployment_id, DeploymentStatus::Failed, Some(err.to_string()))
                    .await;
            }
        }
    }

    async fn diff_and_dispatch(&self, deployment_id: Uuid, desired: DesiredConfiguration) -> anyhow::Result<()> {
        let current = self.store.list_components().await?;
        let current_names: HashSet<String> = current.iter().map(|c| c.name.clone()).collect();
        let desired_names: HashSet<String> = desired.components.iter().map(|c| c.name.clone()).collect();

        let to_remove: Vec<String> = current_names.difference(&desired_names).cloned().collect();

        let mut to_update: Vec<&ComponentConfig> = Vec::new();
        let mut to_add: Vec<&ComponentConfig> = Vec::new();
        for config in &desired.components {
            match current.iter().find(|c| c.name == config.name) {
                Some(existing) if existing.hash != config.hash => to_update.push(config),
                Some(_) => {} // idempotent: hash unchanged, nothing to emit
                None => to_add.push(config),
            }
        }

        info!(
            %deployment_id,
            removals = to_remove.len(),
            updates = to_update.len(),
            additions = to_add.len(),
            "dispatching deployment plan"
        );

        // Removals, then updates, then additions; independent within a
        // class and may proceed in any order (§4.5 step 3).
        let removals = to_remove.into_iter().map(|name| self.remove_one(deployment_id, name));
        join_all(removals).await;

        let updates = to_update.into_iter().map(|config| self.deploy_one(deployment_id, config.clone()));
        join_all(updates).await;

        let additions = to_add.into_iter().map(|config| self.deploy_one(deployment_id, config.clone()));
        join_all(additions).await;

        Ok(())
    }

    async fn deploy_one(&self, deployment_id: Uuid, config: ComponentConfig) {
        let handler = handlers::for_handler(config.resolved_handler());
        if let Err(err) = handler.deploy(&self.handler_ctx, deployment_id, &config).await {
            error!(%deployment_id, component = %config.name, %err, "component deploy failed");
            let _ = self
                .store
                .append_deployment_log(NewDeploymentLogEntry {
                    deployment_id,
                    component_name: Some(config.name.clone()),
                    node_hostname: None,
                    operation: "deploy".into(),
                    status: "failure".into(),
                    message: Some(err.to_string()),
                })
                .await;
        }
    }

    async fn remove_one(&self, deployment_id: Uuid, name: String) {
        let existing = match self.store.get_component(&name).await {
            Ok(Some(c)) => c,
            Ok(None) => return,
            Err(err) => {
                error!(%deployment_id, component = %name, %err, "failed to load component for removal");
                return;
            }
        };
        let handler = handlers::for_handler(
            cosmos_common::Handler::from_str_loose(&existing.handler).unwrap_or(cosmos_common::Handler::Agent),
        );
        if let Err(err) = handler.remove(&self.handler_ctx, deployment_id, &name).await {
            error!(%deployment_id, component = %name, %err, "component removal failed");
            let _ = self
                .store
                .append_deployment_log(NewDeploymentLogEntry {
                    deployment_id,
                    component_name: Some(name),
                    node_hostname: None,
                    operation: "remove".into(),
                    status: "failure".into(),
                    message: Some(err.to_string()),
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockStore;
    use cosmos_common::{ComponentContent, ComponentKind};
    use std::collections::BTreeMap;

    fn script_config(name: &str, hash: &str) -> ComponentConfig {
        ComponentConfig {
            name: name.to_string(),
            kind: ComponentKind::Script,
            hash: hash.to_string(),
            content: ComponentContent::Inline { content: "echo hi".into() },
            tags: Default::default(),
            env: BTreeMap::new(),
            args: Vec::new(),
            handler: None,
            managed: true,
            health_check: None,
        }
    }

    fn handler_ctx(store: Arc<dyn ControllerStore>) -> Arc<HandlerContext> {
        Arc::new(HandlerContext {
            store,
            registry: crate::registry::StreamRegistry::new(),
            http: reqwest::Client::new(),
            external_bulk_dispatcher_url: None,
            external_orchestrator_url: None,
        })
    }

    #[tokio::test]
    async fn reprocessing_same_config_is_idempotent() {
        let store: Arc<dyn ControllerStore> = Arc::new(MockStore::new());
        let planner = Planner::new(store.clone(), handler_ctx(store.clone()));

        let deployment = store.create_deployment("{}".into()).await.unwrap();
        let desired = DesiredConfiguration { components: vec![script_config("test-script", "H")] };

        planner.process_deployment(deployment.id, desired.clone()).await;
        let after_first = store.get_component("test-script").await.unwrap().unwrap();
        assert_eq!(after_first.hash, "H");

        let deployment2 = store.create_deployment("{}".into()).await.unwrap();
        planner.process_deployment(deployment2.id, desired).await;
        let after_second = store.get_component("test-script").await.unwrap().unwrap();
        assert_eq!(after_second.hash, "H");
        let _ = after_first;
    }

    #[tokio::test]
    async fn hash_change_triggers_update() {
        let store: Arc<dyn ControllerStore> = Arc::new(MockStore::new());
        let planner = Planner::new(store.clone(), handler_ctx(store.clone()));

        let d1 = store.create_deployment("{}".into()).await.unwrap();
        planner
            .process_deployment(d1.id, DesiredConfiguration { components: vec![script_config("test-script", "H")] })
            .await;

        let d2 = store.create_deployment("{}".into()).await.unwrap();
        planner
            .process_deployment(d2.id, DesiredConfiguration { components: vec![script_config("test-script", "H2")] })
            .await;

        let component = store.get_component("test-script").await.unwrap().unwrap();
        assert_eq!(component.hash, "H2");
    }

    #[tokio::test]
    async fn empty_desired_config_removes_everything() {
        let store: Arc<dyn ControllerStore> = Arc::new(MockStore::new());
        let planner = Planner::new(store.clone(), handler_ctx(store.clone()));

        let d1 = store.create_deployment("{}".into()).await.unwrap();
        planner
            .process_deployment(d1.id, DesiredConfiguration { components: vec![script_config("test-script", "H")] })
            .await;
        assert!(store.get_component("test-script").await.unwrap().is_some());

        let d2 = store.create_deployment("{}".into()).await.unwrap();
        planner.process_deployment(d2.id, DesiredConfiguration::default()).await;
        assert!(store.get_component("test-script").await.unwrap().is_none());
    }
}
