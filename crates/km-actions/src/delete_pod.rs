//! Pod deletion action.
//!
//! Unlike `restart_pod`, the caller must name the pod; there is no
//! discovery fallback.

use crate::registry::{Action, ActionError, ActionRequest};
use async_trait::async_trait;
use km_connectors::ClusterConnector;
use km_core::{ActionParams, ActionType};
use std::sync::Arc;
use tracing::{info, instrument};

pub struct DeletePodAction {
    cluster: Arc<dyn ClusterConnector>,
}

impl DeletePodAction {
    pub fn new(cluster: Arc<dyn ClusterConnector>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl Action for DeletePodAction {
    fn action_type(&self) -> ActionType {
        ActionType::DeletePod
    }

    fn validate(&self, request: &ActionRequest) -> Result<(), ActionError> {
        match &request.action.parameters {
            ActionParams::DeletePod { pod_name } if !pod_name.is_empty() => Ok(()),
            ActionParams::DeletePod { .. } => Err(ActionError::InvalidParameters(
                "delete_pod requires a pod name".to_string(),
            )),
            other => Err(ActionError::InvalidParameters(format!(
                "delete_pod got {:?}",
                other
            ))),
        }
    }

    #[instrument(skip(self, request), fields(namespace = %request.action.target_namespace))]
    async fn execute(&self, request: &ActionRequest) -> Result<serde_json::Value, ActionError> {
        let namespace = &request.action.target_namespace;
        let pod_name = match &request.action.parameters {
            ActionParams::DeletePod { pod_name } => pod_name.clone(),
            other => {
                return Err(ActionError::InvalidParameters(format!(
                    "delete_pod got {:?}",
                    other
                )))
            }
        };

        let result = self.cluster.delete_pod(namespace, &pod_name).await?;
        info!(pod = %pod_name, "pod deleted");
        Ok(serde_json::json!({
            "pod": pod_name,
            "namespace": namespace,
            "message": result.message,
        }))
    }
}
