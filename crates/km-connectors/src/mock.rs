//! Mock connectors for tests and local development.
//!
//! The cluster mock keeps a mutable in-memory cluster state, records every
//! mutation, and can be scripted to fail so executor retry behavior is
//! testable without a real cluster.

use crate::traits::*;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use km_core::{MetricKind, TimeWindow};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::Mutex;

/// Builds a healthy running pod; tests tweak fields from there.
pub fn sample_pod(name: &str, namespace: &str) -> PodInfo {
    PodInfo {
        name: name.to_string(),
        namespace: namespace.to_string(),
        phase: "Running".to_string(),
        node_name: Some("node-1".to_string()),
        ready: true,
        restart_count: 0,
        waiting_reason: None,
        terminated_reason: None,
        labels: BTreeMap::new(),
        containers: vec![ContainerStatus {
            name: "main".to_string(),
            ready: true,
            restart_count: 0,
            waiting_reason: None,
            terminated_reason: None,
            last_exit_code: None,
        }],
        created_at: Utc::now() - Duration::hours(2),
    }
}

/// A pod stuck in CrashLoopBackOff.
pub fn crashloop_pod(name: &str, namespace: &str, restarts: u32) -> PodInfo {
    let mut pod = sample_pod(name, namespace);
    pod.ready = false;
    pod.restart_count = restarts;
    pod.waiting_reason = Some("CrashLoopBackOff".to_string());
    pod.containers[0].ready = false;
    pod.containers[0].restart_count = restarts;
    pod.containers[0].waiting_reason = Some("CrashLoopBackOff".to_string());
    pod.containers[0].last_exit_code = Some(1);
    pod
}

pub fn sample_deployment(name: &str, namespace: &str, replicas: u32, revision: i64) -> DeploymentInfo {
    DeploymentInfo {
        name: name.to_string(),
        namespace: namespace.to_string(),
        replicas,
        ready_replicas: replicas,
        unavailable_replicas: 0,
        images: vec![format!("{}:r{}", name, revision)],
        revision,
        created_at: Utc::now() - Duration::hours(1),
    }
}

pub fn sample_replicaset(
    deployment: &str,
    namespace: &str,
    revision: i64,
    image: &str,
    age_minutes: i64,
) -> ReplicaSetInfo {
    ReplicaSetInfo {
        name: format!("{}-{:x}", deployment, revision),
        namespace: namespace.to_string(),
        deployment: deployment.to_string(),
        revision,
        images: vec![image.to_string()],
        config_hash: format!("cfg-{}", revision),
        replicas: if age_minutes < 60 { 3 } else { 0 },
        created_at: Utc::now() - Duration::minutes(age_minutes),
    }
}

pub fn sample_node(name: &str) -> NodeInfo {
    NodeInfo {
        name: name.to_string(),
        ready: true,
        disk_pressure: false,
        memory_pressure: false,
        pid_pressure: false,
        unschedulable: false,
    }
}

#[derive(Default)]
struct ClusterState {
    pods: Vec<PodInfo>,
    deployments: Vec<DeploymentInfo>,
    replicasets: Vec<ReplicaSetInfo>,
    nodes: Vec<NodeInfo>,
    hpas: Vec<HpaInfo>,
    events: Vec<EventInfo>,
    mutations: Vec<String>,
    /// Errors handed out by upcoming write calls, in order.
    scripted_failures: VecDeque<ConnectorError>,
    /// Error returned by every read call, when set.
    read_failure: Option<ConnectorError>,
}

/// In-memory cluster API double.
pub struct MockClusterConnector {
    state: Mutex<ClusterState>,
}

impl MockClusterConnector {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClusterState::default()),
        }
    }

    /// A small namespace with one deployment, its pods, and two revisions.
    pub fn with_sample_data(namespace: &str, service: &str) -> Self {
        let mut state = ClusterState::default();
        state.deployments.push(sample_deployment(service, namespace, 3, 42));
        for i in 0..3 {
            let mut pod = sample_pod(&format!("{}-{}", service, i), namespace);
            pod.labels.insert("app".to_string(), service.to_string());
            state.pods.push(pod);
        }
        state.replicasets.push(sample_replicaset(
            service,
            namespace,
            42,
            &format!("{}:1.3.0", service),
            2,
        ));
        state.replicasets.push(sample_replicaset(
            service,
            namespace,
            41,
            &format!("{}:1.2.9", service),
            600,
        ));
        state.nodes.push(sample_node("node-1"));
        Self {
            state: Mutex::new(state),
        }
    }

    pub async fn add_pod(&self, pod: PodInfo) {
        self.state.lock().await.pods.push(pod);
    }

    pub async fn add_deployment(&self, deployment: DeploymentInfo) {
        self.state.lock().await.deployments.push(deployment);
    }

    pub async fn add_replicaset(&self, rs: ReplicaSetInfo) {
        self.state.lock().await.replicasets.push(rs);
    }

    pub async fn add_node(&self, node: NodeInfo) {
        self.state.lock().await.nodes.push(node);
    }

    pub async fn add_hpa(&self, hpa: HpaInfo) {
        self.state.lock().await.hpas.push(hpa);
    }

    pub async fn add_event(&self, event: EventInfo) {
        self.state.lock().await.events.push(event);
    }

    /// Queues errors returned by the next write calls, in order.
    pub async fn script_failures(&self, errors: Vec<ConnectorError>) {
        let mut state = self.state.lock().await;
        state.scripted_failures.extend(errors);
    }

    /// Makes every read call fail until cleared.
    pub async fn fail_reads(&self, error: ConnectorError) {
        self.state.lock().await.read_failure = Some(error);
    }

    /// Mutations applied so far, e.g. `"delete_pod payments/api-0"`.
    pub async fn mutations(&self) -> Vec<String> {
        self.state.lock().await.mutations.clone()
    }

    pub async fn mutation_count(&self) -> usize {
        self.state.lock().await.mutations.len()
    }

    fn take_scripted_failure(state: &mut ClusterState) -> Option<ConnectorError> {
        state.scripted_failures.pop_front()
    }

    fn check_read(state: &ClusterState) -> ConnectorResult<()> {
        match &state.read_failure {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn matches_selector(pod: &PodInfo, selector: Option<&str>) -> bool {
        match selector {
            None => true,
            Some(sel) => match sel.split_once('=') {
                Some((k, v)) => pod.labels.get(k).map(String::as_str) == Some(v),
                None => true,
            },
        }
    }

    /// A new ReplicaSet's pods come up healthy after a deployment-level
    /// change.
    fn heal_deployment_pods(state: &mut ClusterState, namespace: &str, deployment: &str) {
        for pod in state.pods.iter_mut().filter(|p| {
            p.namespace == namespace
                && (p.labels.get("app").map(String::as_str) == Some(deployment)
                    || p.name.starts_with(&format!("{}-", deployment)))
        }) {
            pod.phase = "Running".to_string();
            pod.ready = true;
            pod.waiting_reason = None;
            pod.terminated_reason = None;
            for c in &mut pod.containers {
                c.ready = true;
                c.waiting_reason = None;
                c.terminated_reason = None;
            }
            pod.created_at = Utc::now();
        }
    }
}

impl Default for MockClusterConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterConnector for MockClusterConnector {
    async fn list_pods(
        &self,
        namespace: &str,
        selector: Option<&str>,
    ) -> ConnectorResult<Vec<PodInfo>> {
        let state = self.state.lock().await;
        Self::check_read(&state)?;
        Ok(state
            .pods
            .iter()
            .filter(|p| p.namespace == namespace && Self::matches_selector(p, selector))
            .cloned()
            .collect())
    }

    async fn list_deployments(&self, namespace: &str) -> ConnectorResult<Vec<DeploymentInfo>> {
        let state = self.state.lock().await;
        Self::check_read(&state)?;
        Ok(state
            .deployments
            .iter()
            .filter(|d| d.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn list_replicasets(&self, namespace: &str) -> ConnectorResult<Vec<ReplicaSetInfo>> {
        let state = self.state.lock().await;
        Self::check_read(&state)?;
        Ok(state
            .replicasets
            .iter()
            .filter(|r| r.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn list_nodes(&self) -> ConnectorResult<Vec<NodeInfo>> {
        let state = self.state.lock().await;
        Self::check_read(&state)?;
        Ok(state.nodes.clone())
    }

    async fn list_hpas(&self, namespace: &str) -> ConnectorResult<Vec<HpaInfo>> {
        let state = self.state.lock().await;
        Self::check_read(&state)?;
        Ok(state
            .hpas
            .iter()
            .filter(|h| h.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn list_events(&self, namespace: &str) -> ConnectorResult<Vec<EventInfo>> {
        let state = self.state.lock().await;
        Self::check_read(&state)?;
        let _ = namespace;
        Ok(state.events.clone())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> ConnectorResult<ChangeResult> {
        let mut state = self.state.lock().await;
        if let Some(err) = Self::take_scripted_failure(&mut state) {
            return Err(err);
        }
        let pod = state
            .pods
            .iter_mut()
            .find(|p| p.namespace == namespace && p.name == name)
            .ok_or_else(|| ConnectorError::NotFound(format!("pod {}/{}", namespace, name)))?;
        // Controller-managed pods come back healthy after deletion.
        pod.phase = "Running".to_string();
        pod.ready = true;
        pod.waiting_reason = None;
        pod.terminated_reason = None;
        for c in &mut pod.containers {
            c.ready = true;
            c.waiting_reason = None;
            c.terminated_reason = None;
        }
        pod.created_at = Utc::now();
        state.mutations.push(format!("delete_pod {}/{}", namespace, name));
        Ok(ChangeResult::ok(format!("pod {} deleted", name)))
    }

    async fn restart_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> ConnectorResult<ChangeResult> {
        let mut state = self.state.lock().await;
        if let Some(err) = Self::take_scripted_failure(&mut state) {
            return Err(err);
        }
        let deploy = state
            .deployments
            .iter_mut()
            .find(|d| d.namespace == namespace && d.name == name)
            .ok_or_else(|| {
                ConnectorError::NotFound(format!("deployment {}/{}", namespace, name))
            })?;
        deploy.unavailable_replicas = 0;
        deploy.ready_replicas = deploy.replicas;
        Self::heal_deployment_pods(&mut state, namespace, name);
        state
            .mutations
            .push(format!("restart_deployment {}/{}", namespace, name));
        Ok(ChangeResult::ok(format!(
            "deployment {} restart annotation patched",
            name
        )))
    }

    async fn rollback_deployment(
        &self,
        namespace: &str,
        name: &str,
        revision: Option<i64>,
    ) -> ConnectorResult<ChangeResult> {
        let mut state = self.state.lock().await;
        if let Some(err) = Self::take_scripted_failure(&mut state) {
            return Err(err);
        }
        let current_revision = state
            .deployments
            .iter()
            .find(|d| d.namespace == namespace && d.name == name)
            .map(|d| d.revision)
            .ok_or_else(|| {
                ConnectorError::NotFound(format!("deployment {}/{}", namespace, name))
            })?;

        let target = match revision {
            Some(rev) => state
                .replicasets
                .iter()
                .find(|r| r.namespace == namespace && r.deployment == name && r.revision == rev)
                .cloned(),
            None => {
                let mut revisions: Vec<_> = state
                    .replicasets
                    .iter()
                    .filter(|r| {
                        r.namespace == namespace
                            && r.deployment == name
                            && r.revision < current_revision
                    })
                    .cloned()
                    .collect();
                revisions.sort_by_key(|r| std::cmp::Reverse(r.revision));
                revisions.into_iter().next()
            }
        };
        let target = target.ok_or_else(|| {
            ConnectorError::InvalidRequest("no previous revision available".to_string())
        })?;

        if let Some(deploy) = state
            .deployments
            .iter_mut()
            .find(|d| d.namespace == namespace && d.name == name)
        {
            deploy.revision = target.revision;
            deploy.images = target.images.clone();
            deploy.ready_replicas = deploy.replicas;
            deploy.unavailable_replicas = 0;
        }
        Self::heal_deployment_pods(&mut state, namespace, name);
        state.mutations.push(format!(
            "rollback_deployment {}/{} -> r{}",
            namespace, name, target.revision
        ));
        Ok(ChangeResult::ok(format!(
            "deployment {} rolled back to revision {}",
            name, target.revision
        )))
    }

    async fn scale_deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: u32,
    ) -> ConnectorResult<ChangeResult> {
        let mut state = self.state.lock().await;
        if let Some(err) = Self::take_scripted_failure(&mut state) {
            return Err(err);
        }
        let deploy = state
            .deployments
            .iter_mut()
            .find(|d| d.namespace == namespace && d.name == name)
            .ok_or_else(|| {
                ConnectorError::NotFound(format!("deployment {}/{}", namespace, name))
            })?;
        deploy.replicas = replicas;
        deploy.ready_replicas = replicas;
        state.mutations.push(format!(
            "scale_deployment {}/{} -> {}",
            namespace, name, replicas
        ));
        Ok(ChangeResult::ok(format!(
            "deployment {} scaled to {}",
            name, replicas
        )))
    }

    async fn cordon_node(&self, name: &str) -> ConnectorResult<ChangeResult> {
        let mut state = self.state.lock().await;
        if let Some(err) = Self::take_scripted_failure(&mut state) {
            return Err(err);
        }
        let node = state
            .nodes
            .iter_mut()
            .find(|n| n.name == name)
            .ok_or_else(|| ConnectorError::NotFound(format!("node {}", name)))?;
        if node.unschedulable {
            return Ok(ChangeResult::ok(format!("node {} already cordoned", name)));
        }
        node.unschedulable = true;
        state.mutations.push(format!("cordon_node {}", name));
        Ok(ChangeResult::ok(format!("node {} cordoned", name)))
    }

    async fn uncordon_node(&self, name: &str) -> ConnectorResult<ChangeResult> {
        let mut state = self.state.lock().await;
        if let Some(err) = Self::take_scripted_failure(&mut state) {
            return Err(err);
        }
        let node = state
            .nodes
            .iter_mut()
            .find(|n| n.name == name)
            .ok_or_else(|| ConnectorError::NotFound(format!("node {}", name)))?;
        node.unschedulable = false;
        state.mutations.push(format!("uncordon_node {}", name));
        Ok(ChangeResult::ok(format!("node {} uncordoned", name)))
    }
}

/// Log backend double serving a fixed set of lines.
pub struct MockLogsConnector {
    lines: Mutex<Vec<LogLine>>,
    fail: Mutex<Option<ConnectorError>>,
}

impl MockLogsConnector {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
            fail: Mutex::new(None),
        }
    }

    pub fn with_lines(lines: Vec<&str>) -> Self {
        let now = Utc::now();
        Self {
            lines: Mutex::new(
                lines
                    .into_iter()
                    .map(|l| LogLine {
                        timestamp: now,
                        line: l.to_string(),
                    })
                    .collect(),
            ),
            fail: Mutex::new(None),
        }
    }

    pub async fn fail_with(&self, error: ConnectorError) {
        *self.fail.lock().await = Some(error);
    }

    /// Replaces the served lines.
    pub async fn set_lines(&self, lines: Vec<&str>) {
        let now = Utc::now();
        *self.lines.lock().await = lines
            .into_iter()
            .map(|l| LogLine {
                timestamp: now,
                line: l.to_string(),
            })
            .collect();
    }
}

impl Default for MockLogsConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogsConnector for MockLogsConnector {
    async fn query_range(
        &self,
        _namespace: &str,
        _service: Option<&str>,
        _window: TimeWindow,
    ) -> ConnectorResult<Vec<LogLine>> {
        if let Some(err) = self.fail.lock().await.clone() {
            return Err(err);
        }
        Ok(self.lines.lock().await.clone())
    }
}

/// Metrics backend double with settable instant values.
pub struct MockMetricsConnector {
    values: Mutex<HashMap<MetricKind, f64>>,
}

impl MockMetricsConnector {
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
        }
    }

    pub async fn set(&self, metric: MetricKind, value: f64) {
        self.values.lock().await.insert(metric, value);
    }

    pub async fn clear(&self, metric: MetricKind) {
        self.values.lock().await.remove(&metric);
    }
}

impl Default for MockMetricsConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricsConnector for MockMetricsConnector {
    async fn instant(
        &self,
        metric: MetricKind,
        _selector: &MetricSelector,
    ) -> ConnectorResult<Option<f64>> {
        Ok(self.values.lock().await.get(&metric).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sample_data_listing() {
        let mock = MockClusterConnector::with_sample_data("payments", "api");
        let pods = mock.list_pods("payments", Some("app=api")).await.unwrap();
        assert_eq!(pods.len(), 3);
        let deploys = mock.list_deployments("payments").await.unwrap();
        assert_eq!(deploys.len(), 1);
        assert_eq!(deploys[0].revision, 42);
        let replicasets = mock.list_replicasets("payments").await.unwrap();
        assert_eq!(replicasets.len(), 2);
    }

    #[tokio::test]
    async fn test_selector_filters_pods() {
        let mock = MockClusterConnector::with_sample_data("payments", "api");
        let mut other = sample_pod("worker-0", "payments");
        other
            .labels
            .insert("app".to_string(), "worker".to_string());
        mock.add_pod(other).await;

        let pods = mock.list_pods("payments", Some("app=api")).await.unwrap();
        assert_eq!(pods.len(), 3);
        let all = mock.list_pods("payments", None).await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn test_delete_pod_not_found() {
        let mock = MockClusterConnector::new();
        let result = mock.delete_pod("payments", "ghost").await;
        assert!(matches!(result, Err(ConnectorError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_pod_heals_and_records() {
        let mock = MockClusterConnector::new();
        mock.add_pod(crashloop_pod("api-0", "payments", 15)).await;

        mock.delete_pod("payments", "api-0").await.unwrap();
        let pods = mock.list_pods("payments", None).await.unwrap();
        assert!(pods[0].is_healthy());
        assert_eq!(mock.mutations().await, vec!["delete_pod payments/api-0"]);
    }

    #[tokio::test]
    async fn test_rollback_moves_to_previous_revision() {
        let mock = MockClusterConnector::with_sample_data("payments", "api");
        let result = mock
            .rollback_deployment("payments", "api", None)
            .await
            .unwrap();
        assert!(result.success);
        let deploys = mock.list_deployments("payments").await.unwrap();
        assert_eq!(deploys[0].revision, 41);
        assert_eq!(deploys[0].images, vec!["api:1.2.9".to_string()]);
    }

    #[tokio::test]
    async fn test_rollback_without_history_fails() {
        let mock = MockClusterConnector::new();
        mock.add_deployment(sample_deployment("api", "payments", 3, 1))
            .await;
        let result = mock.rollback_deployment("payments", "api", None).await;
        assert!(matches!(result, Err(ConnectorError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_scripted_failures_consumed_in_order() {
        let mock = MockClusterConnector::with_sample_data("payments", "api");
        mock.script_failures(vec![
            ConnectorError::Unavailable("api server hiccup".into()),
            ConnectorError::Unavailable("still down".into()),
        ])
        .await;

        assert!(mock.delete_pod("payments", "api-0").await.is_err());
        assert!(mock.delete_pod("payments", "api-0").await.is_err());
        assert!(mock.delete_pod("payments", "api-0").await.is_ok());
        assert_eq!(mock.mutation_count().await, 1);
    }

    #[tokio::test]
    async fn test_cordon_idempotent() {
        let mock = MockClusterConnector::new();
        mock.add_node(sample_node("node-1")).await;
        mock.cordon_node("node-1").await.unwrap();
        let again = mock.cordon_node("node-1").await.unwrap();
        assert!(again.message.contains("already"));
        assert_eq!(mock.mutation_count().await, 1);
    }

    #[tokio::test]
    async fn test_metrics_mock_set_and_clear() {
        let metrics = MockMetricsConnector::new();
        let selector = MetricSelector {
            namespace: "payments".into(),
            service: Some("api".into()),
        };
        assert_eq!(
            metrics
                .instant(MetricKind::Http5xxRate, &selector)
                .await
                .unwrap(),
            None
        );
        metrics.set(MetricKind::Http5xxRate, 0.25).await;
        assert_eq!(
            metrics
                .instant(MetricKind::Http5xxRate, &selector)
                .await
                .unwrap(),
            Some(0.25)
        );
    }
}
