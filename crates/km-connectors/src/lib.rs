//! # km-connectors
//!
//! Connector traits for the external systems Kube Medic talks to: the
//! cluster API (read + write subset), the log backend, and the metrics
//! backend, plus in-memory mocks for tests and local development.

pub mod mock;
pub mod traits;

pub use mock::{
    crashloop_pod, sample_deployment, sample_node, sample_pod, sample_replicaset,
    MockClusterConnector, MockLogsConnector, MockMetricsConnector,
};
pub use traits::{
    ChangeResult, ClusterConnector, ConnectorError, ConnectorResult, ContainerStatus,
    DeploymentInfo, EventInfo, HpaInfo, LogLine, LogsConnector, MetricSelector, MetricsConnector,
    NodeInfo, PodInfo, ReplicaSetInfo,
};
