//! Connector trait definitions.
//!
//! These interfaces are the only way the core talks to the cluster API, the
//! log backend, and the metrics backend. Every method suspends on network
//! I/O; implementations must be safe to call from parallel collectors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use km_core::{MetricKind, TimeWindow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors that can occur in connectors.
#[derive(Error, Debug, Clone)]
pub enum ConnectorError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl ConnectorError {
    /// Transient errors are worth retrying; permanent ones are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectorError::RequestFailed(_)
                | ConnectorError::Unavailable(_)
                | ConnectorError::Timeout(_)
        )
    }
}

/// Result type for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Status of one container inside a pod.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerStatus {
    pub name: String,
    pub ready: bool,
    pub restart_count: u32,
    pub waiting_reason: Option<String>,
    pub terminated_reason: Option<String>,
    pub last_exit_code: Option<i32>,
}

/// A pod as seen through the cluster API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub phase: String,
    pub node_name: Option<String>,
    pub ready: bool,
    pub restart_count: u32,
    pub waiting_reason: Option<String>,
    pub terminated_reason: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub containers: Vec<ContainerStatus>,
    pub created_at: DateTime<Utc>,
}

impl PodInfo {
    /// Running with all containers ready.
    pub fn is_healthy(&self) -> bool {
        self.phase == "Running" && self.ready
    }
}

/// A deployment as seen through the cluster API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentInfo {
    pub name: String,
    pub namespace: String,
    pub replicas: u32,
    pub ready_replicas: u32,
    pub unavailable_replicas: u32,
    pub images: Vec<String>,
    pub revision: i64,
    pub created_at: DateTime<Utc>,
}

/// A replicaset revision, used for deploy diffs and rollback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicaSetInfo {
    pub name: String,
    pub namespace: String,
    pub deployment: String,
    pub revision: i64,
    pub images: Vec<String>,
    /// Hash over the pod template config, for drift detection.
    pub config_hash: String,
    pub replicas: u32,
    pub created_at: DateTime<Utc>,
}

/// Node conditions relevant to diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInfo {
    pub name: String,
    pub ready: bool,
    pub disk_pressure: bool,
    pub memory_pressure: bool,
    pub pid_pressure: bool,
    pub unschedulable: bool,
}

impl NodeInfo {
    pub fn is_healthy(&self) -> bool {
        self.ready && !self.disk_pressure && !self.memory_pressure && !self.pid_pressure
    }
}

/// A horizontal pod autoscaler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HpaInfo {
    pub name: String,
    pub namespace: String,
    pub current_replicas: u32,
    pub desired_replicas: u32,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub target_deployment: String,
}

impl HpaInfo {
    pub fn at_max(&self) -> bool {
        self.current_replicas >= self.max_replicas
    }
}

/// A cluster event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventInfo {
    /// "Warning" or "Normal".
    pub event_type: String,
    pub reason: String,
    pub object_kind: String,
    pub object_name: String,
    pub message: String,
    pub count: u32,
    pub last_seen: DateTime<Utc>,
}

/// One line from the log backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

/// Scope for a metrics query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSelector {
    pub namespace: String,
    pub service: Option<String>,
}

/// Outcome of a cluster mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeResult {
    pub success: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ChangeResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Read and write access to the cluster API.
///
/// The write subset is exactly what the remediation executor needs; nothing
/// else in the core mutates the cluster.
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn list_pods(
        &self,
        namespace: &str,
        selector: Option<&str>,
    ) -> ConnectorResult<Vec<PodInfo>>;

    async fn list_deployments(&self, namespace: &str) -> ConnectorResult<Vec<DeploymentInfo>>;

    async fn list_replicasets(&self, namespace: &str) -> ConnectorResult<Vec<ReplicaSetInfo>>;

    async fn list_nodes(&self) -> ConnectorResult<Vec<NodeInfo>>;

    async fn list_hpas(&self, namespace: &str) -> ConnectorResult<Vec<HpaInfo>>;

    async fn list_events(&self, namespace: &str) -> ConnectorResult<Vec<EventInfo>>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> ConnectorResult<ChangeResult>;

    /// Patches the deployment with a rollout-restart annotation.
    async fn restart_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> ConnectorResult<ChangeResult>;

    /// Rolls back to the given revision, or the prior one when `None`.
    async fn rollback_deployment(
        &self,
        namespace: &str,
        name: &str,
        revision: Option<i64>,
    ) -> ConnectorResult<ChangeResult>;

    async fn scale_deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: u32,
    ) -> ConnectorResult<ChangeResult>;

    async fn cordon_node(&self, name: &str) -> ConnectorResult<ChangeResult>;

    async fn uncordon_node(&self, name: &str) -> ConnectorResult<ChangeResult>;
}

/// Range queries against the log backend.
#[async_trait]
pub trait LogsConnector: Send + Sync {
    async fn query_range(
        &self,
        namespace: &str,
        service: Option<&str>,
        window: TimeWindow,
    ) -> ConnectorResult<Vec<LogLine>>;
}

/// Instant queries against the metrics backend.
#[async_trait]
pub trait MetricsConnector: Send + Sync {
    /// Returns `None` when the backend has no series for the selector.
    async fn instant(
        &self,
        metric: MetricKind,
        selector: &MetricSelector,
    ) -> ConnectorResult<Option<f64>>;
}
