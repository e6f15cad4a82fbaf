//! # km-collectors
//!
//! Evidence collectors for Kube Medic. Each collector is polymorphic over
//! the `{collect}` capability and registered by source name; the registry
//! runs them in parallel under per-source deadlines and an overall budget.

pub mod cluster_state;
pub mod deploy_diff;
pub mod logs;
pub mod metrics;
pub mod registry;

pub use cluster_state::ClusterStateCollector;
pub use deploy_diff::DeployDiffCollector;
pub use logs::LogsCollector;
pub use metrics::MetricsCollector;
pub use registry::{Collector, CollectorRegistry, IncidentContext};

use km_connectors::{ClusterConnector, LogsConnector, MetricsConnector};
use std::sync::Arc;

/// Builds a registry holding the four built-in collectors.
pub fn default_registry(
    cluster: Arc<dyn ClusterConnector>,
    logs: Arc<dyn LogsConnector>,
    metrics: Arc<dyn MetricsConnector>,
) -> CollectorRegistry {
    let mut registry = CollectorRegistry::new();
    registry.register(Arc::new(ClusterStateCollector::new(Arc::clone(&cluster))));
    registry.register(Arc::new(LogsCollector::new(logs)));
    registry.register(Arc::new(MetricsCollector::new(metrics)));
    registry.register(Arc::new(DeployDiffCollector::new(cluster)));
    registry
}
