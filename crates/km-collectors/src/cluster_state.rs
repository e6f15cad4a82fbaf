//! Cluster-state collector.
//!
//! Fetches pods, deployments, replicasets, nodes, HPAs, and events for the
//! incident's namespace and emits pod/container/node/HPA/event evidence
//! along with the graph entities and relations observed.

use crate::registry::{Collector, IncidentContext};
use async_trait::async_trait;
use km_connectors::{ClusterConnector, EventInfo, HpaInfo, NodeInfo, PodInfo};
use km_core::{
    signal, CollectorOutput, EntityDraft, EntityKey, EntityKind, Evidence, EvidenceData,
    EvidenceSource, EventRecord, RelationDraft, RelationType, TimeWindow,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Container reasons that are unambiguous on their own.
const TERMINAL_REASONS: &[&str] = &["OOMKilled", "ImagePullBackOff", "ErrImagePull"];

/// Event reasons worth keeping.
const EVENT_REASONS: &[&str] = &["FailedScheduling", "BackOff", "Unhealthy", "FailedMount"];

pub struct ClusterStateCollector {
    cluster: Arc<dyn ClusterConnector>,
}

impl ClusterStateCollector {
    pub fn new(cluster: Arc<dyn ClusterConnector>) -> Self {
        Self { cluster }
    }

    fn pod_signal_strength(pod: &PodInfo) -> f64 {
        let reasons = pod
            .waiting_reason
            .iter()
            .chain(pod.terminated_reason.iter());
        for reason in reasons {
            if TERMINAL_REASONS.contains(&reason.as_str()) {
                return signal::TERMINAL;
            }
            if reason == "CrashLoopBackOff" {
                return signal::DEPLOY_CORRELATED;
            }
        }
        if pod.restart_count > 5 {
            return signal::HIGH_RESTARTS;
        }
        if !pod.is_healthy() {
            return signal::PRESENT;
        }
        signal::INFORMATIONAL
    }

    fn pod_summary(pod: &PodInfo) -> String {
        let mut summary = format!("Pod {}: {}", pod.name, pod.phase);
        if let Some(reason) = &pod.waiting_reason {
            summary.push_str(&format!(" (waiting: {})", reason));
        }
        if let Some(reason) = &pod.terminated_reason {
            summary.push_str(&format!(" (terminated: {})", reason));
        }
        if pod.restart_count > 0 {
            summary.push_str(&format!(", {} restarts", pod.restart_count));
        }
        summary
    }

    fn collect_pods(
        &self,
        ctx: &IncidentContext,
        window: TimeWindow,
        pods: &[PodInfo],
        out: &mut CollectorOutput,
    ) {
        for pod in pods {
            let strength = Self::pod_signal_strength(pod);
            let data = EvidenceData::PodState {
                name: pod.name.clone(),
                phase: pod.phase.clone(),
                node_name: pod.node_name.clone(),
                restart_count: pod.restart_count,
                waiting_reason: pod.waiting_reason.clone(),
                terminated_reason: pod.terminated_reason.clone(),
                ready: pod.ready,
            };
            out.evidence.push(
                Evidence::new(
                    ctx.incident_id,
                    EvidenceSource::K8s,
                    &pod.name,
                    &ctx.namespace,
                    data,
                    strength,
                    window,
                )
                .with_summary(Self::pod_summary(pod)),
            );

            for container in &pod.containers {
                if container.waiting_reason.is_none() && container.terminated_reason.is_none() {
                    continue;
                }
                let data = EvidenceData::ContainerState {
                    pod: pod.name.clone(),
                    container: container.name.clone(),
                    waiting_reason: container.waiting_reason.clone(),
                    terminated_reason: container.terminated_reason.clone(),
                    restart_count: container.restart_count,
                    last_exit_code: container.last_exit_code,
                };
                out.evidence.push(Evidence::new(
                    ctx.incident_id,
                    EvidenceSource::K8s,
                    &container.name,
                    &ctx.namespace,
                    data,
                    strength,
                    window,
                ));
            }

            let pod_key =
                EntityKey::new(&ctx.cluster, &ctx.namespace, EntityKind::Pod, &pod.name);
            let mut attrs = HashMap::new();
            attrs.insert("phase".to_string(), serde_json::json!(pod.phase));
            attrs.insert(
                "restart_count".to_string(),
                serde_json::json!(pod.restart_count),
            );
            out.entities.push(EntityDraft {
                key: pod_key.clone(),
                attrs,
            });

            if let Some(service) = &ctx.service {
                out.relations.push(RelationDraft {
                    from: pod_key.clone(),
                    to: EntityKey::new(
                        &ctx.cluster,
                        &ctx.namespace,
                        EntityKind::Deployment,
                        service,
                    ),
                    relation: RelationType::PartOf,
                });
            }
            if let Some(node) = &pod.node_name {
                out.relations.push(RelationDraft {
                    from: pod_key,
                    to: EntityKey::cluster_scoped(&ctx.cluster, EntityKind::Node, node),
                    relation: RelationType::ScheduledOn,
                });
            }
        }
    }

    fn collect_nodes(
        &self,
        ctx: &IncidentContext,
        window: TimeWindow,
        nodes: &[NodeInfo],
        pods: &[PodInfo],
        out: &mut CollectorOutput,
    ) {
        // Failing-pod counts per node feed the infrastructure rule.
        let mut failures_per_node: HashMap<&str, u32> = HashMap::new();
        for pod in pods {
            if pod.is_healthy() {
                continue;
            }
            if let Some(node) = &pod.node_name {
                *failures_per_node.entry(node.as_str()).or_insert(0) += 1;
            }
        }

        for node in nodes {
            if node.is_healthy() {
                continue;
            }
            let pod_failures = failures_per_node
                .get(node.name.as_str())
                .copied()
                .unwrap_or(0);
            let data = EvidenceData::NodeState {
                name: node.name.clone(),
                ready: node.ready,
                disk_pressure: node.disk_pressure,
                memory_pressure: node.memory_pressure,
                pid_pressure: node.pid_pressure,
                unschedulable: node.unschedulable,
                pod_failures,
            };
            out.evidence.push(
                Evidence::new(
                    ctx.incident_id,
                    EvidenceSource::K8s,
                    &node.name,
                    "",
                    data,
                    signal::HIGH_RESTARTS,
                    window,
                )
                .with_summary(format!("Node {}: unhealthy", node.name)),
            );
            out.entities.push(EntityDraft {
                key: EntityKey::cluster_scoped(&ctx.cluster, EntityKind::Node, &node.name),
                attrs: HashMap::from([("ready".to_string(), serde_json::json!(node.ready))]),
            });
        }
    }

    fn collect_hpas(
        &self,
        ctx: &IncidentContext,
        window: TimeWindow,
        hpas: &[HpaInfo],
        out: &mut CollectorOutput,
    ) {
        for hpa in hpas {
            let at_max = hpa.at_max();
            let data = EvidenceData::HpaState {
                name: hpa.name.clone(),
                current_replicas: hpa.current_replicas,
                min_replicas: hpa.min_replicas,
                max_replicas: hpa.max_replicas,
                at_max,
                target_deployment: hpa.target_deployment.clone(),
            };
            let strength = if at_max {
                signal::HIGH_RESTARTS
            } else {
                signal::INFORMATIONAL
            };
            let mut summary = format!(
                "HPA {}: {}/{} replicas",
                hpa.name, hpa.current_replicas, hpa.max_replicas
            );
            if at_max {
                summary.push_str(" (at max)");
            }
            out.evidence.push(
                Evidence::new(
                    ctx.incident_id,
                    EvidenceSource::K8s,
                    &hpa.name,
                    &ctx.namespace,
                    data,
                    strength,
                    window,
                )
                .with_summary(summary),
            );

            let hpa_key = EntityKey::new(&ctx.cluster, &ctx.namespace, EntityKind::Hpa, &hpa.name);
            out.entities.push(EntityDraft {
                key: hpa_key.clone(),
                attrs: HashMap::from([("at_max".to_string(), serde_json::json!(at_max))]),
            });
            out.relations.push(RelationDraft {
                from: EntityKey::new(
                    &ctx.cluster,
                    &ctx.namespace,
                    EntityKind::Deployment,
                    &hpa.target_deployment,
                ),
                to: hpa_key,
                relation: RelationType::ScaledBy,
            });
        }
    }

    fn collect_events(
        &self,
        ctx: &IncidentContext,
        window: TimeWindow,
        events: &[EventInfo],
        out: &mut CollectorOutput,
    ) {
        let records: Vec<EventRecord> = events
            .iter()
            .filter(|e| EVENT_REASONS.contains(&e.reason.as_str()))
            .map(|e| EventRecord {
                reason: e.reason.clone(),
                object_kind: e.object_kind.clone(),
                object_name: e.object_name.clone(),
                message: e.message.clone(),
                count: e.count,
                last_seen: e.last_seen,
            })
            .collect();
        if records.is_empty() {
            return;
        }
        let count = records.len();
        out.evidence.push(
            Evidence::new(
                ctx.incident_id,
                EvidenceSource::K8s,
                "events",
                &ctx.namespace,
                EvidenceData::Events { records },
                signal::PRESENT,
                window,
            )
            .with_summary(format!("{} warning events in {}", count, ctx.namespace)),
        );
    }
}

#[async_trait]
impl Collector for ClusterStateCollector {
    fn name(&self) -> &str {
        "cluster_state"
    }

    async fn collect(&self, ctx: &IncidentContext, window: TimeWindow) -> CollectorOutput {
        let mut out = CollectorOutput::new(self.name());
        let selector = ctx.selector();

        let pods = match self
            .cluster
            .list_pods(&ctx.namespace, selector.as_deref())
            .await
        {
            Ok(pods) => pods,
            Err(e) => {
                out.errors.push(format!("pods: {}", e));
                out.partial = true;
                Vec::new()
            }
        };
        self.collect_pods(ctx, window, &pods, &mut out);

        match self.cluster.list_deployments(&ctx.namespace).await {
            Ok(deployments) => {
                for deploy in deployments {
                    let mut attrs = HashMap::new();
                    attrs.insert("replicas".to_string(), serde_json::json!(deploy.replicas));
                    attrs.insert(
                        "ready_replicas".to_string(),
                        serde_json::json!(deploy.ready_replicas),
                    );
                    attrs.insert("revision".to_string(), serde_json::json!(deploy.revision));
                    out.entities.push(EntityDraft {
                        key: EntityKey::new(
                            &ctx.cluster,
                            &ctx.namespace,
                            EntityKind::Deployment,
                            &deploy.name,
                        ),
                        attrs,
                    });
                }
            }
            Err(e) => {
                out.errors.push(format!("deployments: {}", e));
                out.partial = true;
            }
        }

        match self.cluster.list_nodes().await {
            Ok(nodes) => self.collect_nodes(ctx, window, &nodes, &pods, &mut out),
            Err(e) => {
                out.errors.push(format!("nodes: {}", e));
                out.partial = true;
            }
        }

        match self.cluster.list_hpas(&ctx.namespace).await {
            Ok(hpas) => self.collect_hpas(ctx, window, &hpas, &mut out),
            Err(e) => {
                out.errors.push(format!("hpas: {}", e));
                out.partial = true;
            }
        }

        match self.cluster.list_events(&ctx.namespace).await {
            Ok(events) => self.collect_events(ctx, window, &events, &mut out),
            Err(e) => {
                out.errors.push(format!("events: {}", e));
                out.partial = true;
            }
        }

        debug!(
            evidence = out.evidence.len(),
            entities = out.entities.len(),
            "cluster state collected"
        );
        out
    }
}
