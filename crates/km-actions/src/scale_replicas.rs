//! Deployment scaling action.

use crate::registry::{Action, ActionError, ActionRequest};
use async_trait::async_trait;
use km_connectors::ClusterConnector;
use km_core::{ActionParams, ActionType};
use std::sync::Arc;
use tracing::{info, instrument};

pub struct ScaleReplicasAction {
    cluster: Arc<dyn ClusterConnector>,
}

impl ScaleReplicasAction {
    pub fn new(cluster: Arc<dyn ClusterConnector>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl Action for ScaleReplicasAction {
    fn action_type(&self) -> ActionType {
        ActionType::ScaleReplicas
    }

    fn validate(&self, request: &ActionRequest) -> Result<(), ActionError> {
        match &request.action.parameters {
            ActionParams::ScaleReplicas {
                deployment,
                replicas,
            } if !deployment.is_empty() && *replicas > 0 => Ok(()),
            ActionParams::ScaleReplicas { .. } => Err(ActionError::InvalidParameters(
                "scale_replicas requires a deployment and a positive replica count".to_string(),
            )),
            other => Err(ActionError::InvalidParameters(format!(
                "scale_replicas got {:?}",
                other
            ))),
        }
    }

    #[instrument(skip(self, request), fields(namespace = %request.action.target_namespace))]
    async fn execute(&self, request: &ActionRequest) -> Result<serde_json::Value, ActionError> {
        let namespace = &request.action.target_namespace;
        let (deployment, replicas) = match &request.action.parameters {
            ActionParams::ScaleReplicas {
                deployment,
                replicas,
            } => (deployment.clone(), *replicas),
            other => {
                return Err(ActionError::InvalidParameters(format!(
                    "scale_replicas got {:?}",
                    other
                )))
            }
        };

        let result = self
            .cluster
            .scale_deployment(namespace, &deployment, replicas)
            .await?;
        info!(deployment = %deployment, replicas, "deployment scaled");
        Ok(serde_json::json!({
            "deployment": deployment,
            "namespace": namespace,
            "replicas": replicas,
            "message": result.message,
        }))
    }
}
