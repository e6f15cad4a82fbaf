//! Pod restart action.
//!
//! Deletes the target pod and relies on its controller to recreate it. When
//! no pod is named, the first unhealthy pod behind the incident's selector
//! is picked.

use crate::registry::{Action, ActionError, ActionRequest};
use async_trait::async_trait;
use km_connectors::ClusterConnector;
use km_core::{ActionParams, ActionType};
use std::sync::Arc;
use tracing::{info, instrument};

pub struct RestartPodAction {
    cluster: Arc<dyn ClusterConnector>,
}

impl RestartPodAction {
    pub fn new(cluster: Arc<dyn ClusterConnector>) -> Self {
        Self { cluster }
    }

    async fn find_target_pod(
        &self,
        namespace: &str,
        service: Option<&str>,
    ) -> Result<String, ActionError> {
        let selector = service.map(|s| format!("app={}", s));
        let pods = self.cluster.list_pods(namespace, selector.as_deref()).await?;
        if pods.is_empty() {
            return Err(ActionError::NotFound(format!(
                "no pods in {} for selector {:?}",
                namespace, selector
            )));
        }
        let target = pods
            .iter()
            .find(|p| !p.is_healthy())
            .unwrap_or(&pods[0])
            .name
            .clone();
        Ok(target)
    }
}

#[async_trait]
impl Action for RestartPodAction {
    fn action_type(&self) -> ActionType {
        ActionType::RestartPod
    }

    fn validate(&self, request: &ActionRequest) -> Result<(), ActionError> {
        match &request.action.parameters {
            ActionParams::RestartPod { .. } => Ok(()),
            other => Err(ActionError::InvalidParameters(format!(
                "restart_pod got {:?}",
                other
            ))),
        }
    }

    #[instrument(skip(self, request), fields(namespace = %request.action.target_namespace))]
    async fn execute(&self, request: &ActionRequest) -> Result<serde_json::Value, ActionError> {
        let namespace = &request.action.target_namespace;
        let pod_name = match &request.action.parameters {
            ActionParams::RestartPod {
                pod_name: Some(name),
            } => name.clone(),
            _ => {
                self.find_target_pod(namespace, request.service.as_deref())
                    .await?
            }
        };

        let result = self.cluster.delete_pod(namespace, &pod_name).await?;
        info!(pod = %pod_name, "pod deleted for restart");
        Ok(serde_json::json!({
            "pod": pod_name,
            "namespace": namespace,
            "message": result.message,
        }))
    }
}
