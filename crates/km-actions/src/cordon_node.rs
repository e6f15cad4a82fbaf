//! Node cordon action.

use crate::registry::{Action, ActionError, ActionRequest};
use async_trait::async_trait;
use km_connectors::ClusterConnector;
use km_core::{ActionParams, ActionType};
use std::sync::Arc;
use tracing::{info, instrument};

pub struct CordonNodeAction {
    cluster: Arc<dyn ClusterConnector>,
}

impl CordonNodeAction {
    pub fn new(cluster: Arc<dyn ClusterConnector>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl Action for CordonNodeAction {
    fn action_type(&self) -> ActionType {
        ActionType::CordonNode
    }

    fn validate(&self, request: &ActionRequest) -> Result<(), ActionError> {
        match &request.action.parameters {
            ActionParams::CordonNode { node_name } if !node_name.is_empty() => Ok(()),
            other => Err(ActionError::InvalidParameters(format!(
                "cordon_node got {:?}",
                other
            ))),
        }
    }

    #[instrument(skip(self, request))]
    async fn execute(&self, request: &ActionRequest) -> Result<serde_json::Value, ActionError> {
        let node_name = match &request.action.parameters {
            ActionParams::CordonNode { node_name } => node_name.clone(),
            other => {
                return Err(ActionError::InvalidParameters(format!(
                    "cordon_node got {:?}",
                    other
                )))
            }
        };

        let result = self.cluster.cordon_node(&node_name).await?;
        info!(node = %node_name, "node cordoned");
        Ok(serde_json::json!({
            "node": node_name,
            "message": result.message,
        }))
    }
}
