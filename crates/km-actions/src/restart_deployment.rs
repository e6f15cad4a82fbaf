//! Deployment rollout-restart action.

use crate::registry::{Action, ActionError, ActionRequest};
use async_trait::async_trait;
use km_connectors::ClusterConnector;
use km_core::{ActionParams, ActionType};
use std::sync::Arc;
use tracing::{info, instrument};

pub struct RestartDeploymentAction {
    cluster: Arc<dyn ClusterConnector>,
}

impl RestartDeploymentAction {
    pub fn new(cluster: Arc<dyn ClusterConnector>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl Action for RestartDeploymentAction {
    fn action_type(&self) -> ActionType {
        ActionType::RestartDeployment
    }

    fn validate(&self, request: &ActionRequest) -> Result<(), ActionError> {
        match &request.action.parameters {
            ActionParams::RestartDeployment { deployment } if !deployment.is_empty() => Ok(()),
            other => Err(ActionError::InvalidParameters(format!(
                "restart_deployment got {:?}",
                other
            ))),
        }
    }

    #[instrument(skip(self, request), fields(namespace = %request.action.target_namespace))]
    async fn execute(&self, request: &ActionRequest) -> Result<serde_json::Value, ActionError> {
        let namespace = &request.action.target_namespace;
        let deployment = match &request.action.parameters {
            ActionParams::RestartDeployment { deployment } => deployment.clone(),
            other => {
                return Err(ActionError::InvalidParameters(format!(
                    "restart_deployment got {:?}",
                    other
                )))
            }
        };

        let result = self.cluster.restart_deployment(namespace, &deployment).await?;
        info!(deployment = %deployment, "deployment restart annotation patched");
        Ok(serde_json::json!({
            "deployment": deployment,
            "namespace": namespace,
            "message": result.message,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use km_connectors::MockClusterConnector;
    use km_core::RemediationAction;
    use uuid::Uuid;

    fn request(deployment: &str) -> ActionRequest {
        ActionRequest {
            action: RemediationAction::propose(
                Uuid::new_v4(),
                None,
                ActionType::RestartDeployment,
                deployment,
                "payments",
                ActionParams::RestartDeployment {
                    deployment: deployment.to_string(),
                },
            ),
            service: None,
        }
    }

    #[tokio::test]
    async fn test_restart_patches_deployment() {
        let cluster = Arc::new(MockClusterConnector::with_sample_data("payments", "api"));
        let action = RestartDeploymentAction::new(cluster.clone());
        action.execute(&request("api")).await.unwrap();
        assert_eq!(
            cluster.mutations().await,
            vec!["restart_deployment payments/api"]
        );
    }

    #[tokio::test]
    async fn test_unknown_deployment_not_found() {
        let cluster = Arc::new(MockClusterConnector::new());
        let action = RestartDeploymentAction::new(cluster);
        let result = action.execute(&request("ghost")).await;
        assert!(matches!(result, Err(ActionError::NotFound(_))));
    }
}
