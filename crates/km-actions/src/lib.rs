//! # km-actions
//!
//! The remediation executor and verifier for Kube Medic. Actions are
//! idempotent cluster mutations behind a registry that enforces
//! idempotency-key replay, per-target leases, and bounded retries.

pub mod cordon_node;
pub mod delete_pod;
pub mod registry;
pub mod restart_deployment;
pub mod restart_pod;
pub mod rollback_deployment;
pub mod scale_replicas;
pub mod verifier;

pub use cordon_node::CordonNodeAction;
pub use delete_pod::DeletePodAction;
pub use registry::{Action, ActionError, ActionRegistry, ActionRequest, ExecutorConfig};
pub use restart_deployment::RestartDeploymentAction;
pub use restart_pod::RestartPodAction;
pub use rollback_deployment::RollbackDeploymentAction;
pub use scale_replicas::ScaleReplicasAction;
pub use verifier::{VerificationBaseline, Verifier};

use km_connectors::ClusterConnector;
use std::sync::Arc;

/// Builds a registry with every built-in action registered.
pub fn default_registry(
    cluster: Arc<dyn ClusterConnector>,
    config: ExecutorConfig,
) -> ActionRegistry {
    let mut registry = ActionRegistry::new(config);
    registry.register(Arc::new(RestartPodAction::new(Arc::clone(&cluster))));
    registry.register(Arc::new(DeletePodAction::new(Arc::clone(&cluster))));
    registry.register(Arc::new(RestartDeploymentAction::new(Arc::clone(&cluster))));
    registry.register(Arc::new(RollbackDeploymentAction::new(Arc::clone(&cluster))));
    registry.register(Arc::new(ScaleReplicasAction::new(Arc::clone(&cluster))));
    registry.register(Arc::new(CordonNodeAction::new(cluster)));
    registry
}
