//! Deployment rollback action.

use crate::registry::{Action, ActionError, ActionRequest};
use async_trait::async_trait;
use km_connectors::ClusterConnector;
use km_core::{ActionParams, ActionType};
use std::sync::Arc;
use tracing::{info, instrument};

pub struct RollbackDeploymentAction {
    cluster: Arc<dyn ClusterConnector>,
}

impl RollbackDeploymentAction {
    pub fn new(cluster: Arc<dyn ClusterConnector>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl Action for RollbackDeploymentAction {
    fn action_type(&self) -> ActionType {
        ActionType::RollbackDeployment
    }

    fn validate(&self, request: &ActionRequest) -> Result<(), ActionError> {
        match &request.action.parameters {
            ActionParams::RollbackDeployment { deployment, .. } if !deployment.is_empty() => Ok(()),
            other => Err(ActionError::InvalidParameters(format!(
                "rollback_deployment got {:?}",
                other
            ))),
        }
    }

    #[instrument(skip(self, request), fields(namespace = %request.action.target_namespace))]
    async fn execute(&self, request: &ActionRequest) -> Result<serde_json::Value, ActionError> {
        let namespace = &request.action.target_namespace;
        let (deployment, revision) = match &request.action.parameters {
            ActionParams::RollbackDeployment {
                deployment,
                revision,
            } => (deployment.clone(), *revision),
            other => {
                return Err(ActionError::InvalidParameters(format!(
                    "rollback_deployment got {:?}",
                    other
                )))
            }
        };

        let result = self
            .cluster
            .rollback_deployment(namespace, &deployment, revision)
            .await?;
        info!(deployment = %deployment, "deployment rolled back");
        Ok(serde_json::json!({
            "deployment": deployment,
            "namespace": namespace,
            "requested_revision": revision,
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

    fn request(deployment: &str, revision: Option<i64>) -> ActionRequest {
        ActionRequest {
            action: RemediationAction::propose(
                Uuid::new_v4(),
                None,
                ActionType::RollbackDeployment,
                deployment,
                "payments",
                ActionParams::RollbackDeployment {
                    deployment: deployment.to_string(),
                    revision,
                },
            ),
            service: None,
        }
    }

    #[tokio::test]
    async fn test_rolls_back_to_previous_revision() {
        let cluster = Arc::new(MockClusterConnector::with_sample_data("payments", "api"));
        let action = RollbackDeploymentAction::new(cluster.clone());
        let details = action.execute(&request("api", None)).await.unwrap();
        assert!(details["message"]
            .as_str()
            .unwrap()
            .contains("revision 41"));

        let deploys = cluster.list_deployments("payments").await.unwrap();
        assert_eq!(deploys[0].revision, 41);
    }

    #[tokio::test]
    async fn test_rollback_without_history_invalid() {
        let cluster = Arc::new(MockClusterConnector::new());
        cluster
            .add_deployment(km_connectors::sample_deployment("api", "payments", 3, 1))
            .await;
        let action = RollbackDeploymentAction::new(cluster);
        let result = action.execute(&request("api", None)).await;
        assert!(matches!(result, Err(ActionError::InvalidParameters(_))));
    }

    #[tokio::test]
    async fn test_repeat_rollback_is_stable() {
        // Once rolled back to 41, a second run finds no older revision and
        // fails rather than flapping between revisions.
        let cluster = Arc::new(MockClusterConnector::with_sample_data("payments", "api"));
        let action = RollbackDeploymentAction::new(cluster.clone());
        action.execute(&request("api", None)).await.unwrap();
        let second = action.execute(&request("api", None)).await;
        assert!(second.is_err());
        let deploys = cluster.list_deployments("payments").await.unwrap();
        assert_eq!(deploys[0].revision, 41);
    }
}
