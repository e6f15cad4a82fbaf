//! Evidence graph store.
//!
//! A typed graph linking incidents to infrastructure entities and evidence.
//! Nodes are keyed by `(cluster, namespace, kind, name)` and upserts are
//! idempotent on that key, so parallel collectors can write without
//! coordination. The graph is stored as nodes plus external adjacency rather
//! than object references.

use crate::evidence::Evidence;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Maximum BFS depth served by `subgraph`.
pub const MAX_SUBGRAPH_DEPTH: u32 = 3;

/// Errors from graph operations.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Entity not found: {0}")]
    EntityNotFound(Uuid),

    #[error("Incident not registered in graph: {0}")]
    IncidentNotRegistered(Uuid),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Node labels in the evidence graph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Incident,
    Pod,
    Deployment,
    ReplicaSet,
    Node,
    Hpa,
    Evidence,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntityKind::Incident => "incident",
            EntityKind::Pod => "pod",
            EntityKind::Deployment => "deployment",
            EntityKind::ReplicaSet => "replicaset",
            EntityKind::Node => "node",
            EntityKind::Hpa => "hpa",
            EntityKind::Evidence => "evidence",
        };
        write!(f, "{}", s)
    }
}

/// The idempotency key for graph nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub cluster: String,
    pub namespace: String,
    pub kind: EntityKind,
    pub name: String,
}

impl EntityKey {
    pub fn new(cluster: &str, namespace: &str, kind: EntityKind, name: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            kind,
            name: name.to_string(),
        }
    }

    /// Cluster-scoped entities (nodes) carry an empty namespace.
    pub fn cluster_scoped(cluster: &str, kind: EntityKind, name: &str) -> Self {
        Self::new(cluster, "", kind, name)
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.kind, self.cluster, self.namespace, self.name
        )
    }
}

/// Relationship semantics between graph nodes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    /// Incident -> Pod
    Affects,
    /// Pod -> Deployment
    PartOf,
    /// Pod -> Node
    ScheduledOn,
    /// Deployment -> HPA
    ScaledBy,
    /// Incident -> Evidence
    HasEvidence,
    /// Evidence -> Entity
    About,
}

/// A node in the evidence graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEntity {
    pub id: Uuid,
    pub key: EntityKey,
    pub attrs: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A directed edge in the evidence graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: Uuid,
    pub to: Uuid,
    pub relation: RelationType,
    pub props: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// A bounded view of the graph around one incident.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subgraph {
    pub nodes: Vec<GraphEntity>,
    pub edges: Vec<GraphEdge>,
}

/// An entity observed by a collector, not yet materialized in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDraft {
    pub key: EntityKey,
    pub attrs: HashMap<String, serde_json::Value>,
}

/// A relation observed by a collector, keyed by entity keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationDraft {
    pub from: EntityKey,
    pub to: EntityKey,
    pub relation: RelationType,
}

/// Storage abstraction for the evidence graph.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Creates the incident node and indexes it by incident id.
    async fn register_incident(
        &self,
        incident_id: Uuid,
        cluster: &str,
        namespace: &str,
        attrs: HashMap<String, serde_json::Value>,
    ) -> Result<Uuid, GraphError>;

    /// Idempotent on the key; merges attributes (scalar last-writer-wins,
    /// union on sets).
    async fn upsert_entity(
        &self,
        key: EntityKey,
        attrs: HashMap<String, serde_json::Value>,
    ) -> Result<Uuid, GraphError>;

    /// Idempotent on `(from, to, relation)`.
    async fn link(
        &self,
        from: Uuid,
        to: Uuid,
        relation: RelationType,
        props: HashMap<String, serde_json::Value>,
    ) -> Result<(), GraphError>;

    /// Links the incident node to an existing entity.
    async fn link_incident_to_entity(
        &self,
        incident_id: Uuid,
        entity_id: Uuid,
        relation: RelationType,
        props: HashMap<String, serde_json::Value>,
    ) -> Result<(), GraphError>;

    /// Appends an evidence node, a HAS_EVIDENCE edge from the incident, and
    /// an ABOUT edge to the entity the evidence observes (when given).
    async fn attach_evidence(
        &self,
        incident_id: Uuid,
        evidence: &Evidence,
        about: Option<EntityKey>,
    ) -> Result<Uuid, GraphError>;

    /// Bounded BFS from the incident node; `depth` is clamped to 3.
    async fn subgraph(&self, incident_id: Uuid, depth: u32) -> Result<Subgraph, GraphError>;

    /// Resolves an entity id by key, if present.
    async fn entity_id(&self, key: &EntityKey) -> Option<Uuid>;
}

#[derive(Default)]
struct GraphInner {
    entities: HashMap<Uuid, GraphEntity>,
    by_key: HashMap<EntityKey, Uuid>,
    edges: HashMap<(Uuid, Uuid, RelationType), GraphEdge>,
    adjacency: HashMap<Uuid, Vec<Uuid>>,
    incidents: HashMap<Uuid, Uuid>,
}

impl GraphInner {
    fn upsert(&mut self, key: EntityKey, attrs: HashMap<String, serde_json::Value>) -> Uuid {
        let now = Utc::now();
        if let Some(&id) = self.by_key.get(&key) {
            if let Some(entity) = self.entities.get_mut(&id) {
                for (k, v) in attrs {
                    merge_attr(&mut entity.attrs, k, v);
                }
                entity.updated_at = now;
            }
            return id;
        }
        let id = Uuid::new_v4();
        self.by_key.insert(key.clone(), id);
        self.entities.insert(
            id,
            GraphEntity {
                id,
                key,
                attrs,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    fn link(
        &mut self,
        from: Uuid,
        to: Uuid,
        relation: RelationType,
        props: HashMap<String, serde_json::Value>,
    ) -> Result<(), GraphError> {
        if !self.entities.contains_key(&from) {
            return Err(GraphError::EntityNotFound(from));
        }
        if !self.entities.contains_key(&to) {
            return Err(GraphError::EntityNotFound(to));
        }
        let edge_key = (from, to, relation);
        if self.edges.contains_key(&edge_key) {
            return Ok(());
        }
        self.edges.insert(
            edge_key,
            GraphEdge {
                from,
                to,
                relation,
                props,
                created_at: Utc::now(),
            },
        );
        self.adjacency.entry(from).or_default().push(to);
        self.adjacency.entry(to).or_default().push(from);
        Ok(())
    }
}

/// Merges one attribute under the key rule: arrays union, scalars
/// last-writer-wins.
fn merge_attr(
    attrs: &mut HashMap<String, serde_json::Value>,
    key: String,
    new: serde_json::Value,
) {
    match (attrs.get_mut(&key), &new) {
        (Some(serde_json::Value::Array(existing)), serde_json::Value::Array(incoming)) => {
            for item in incoming {
                if !existing.contains(item) {
                    existing.push(item.clone());
                }
            }
        }
        _ => {
            attrs.insert(key, new);
        }
    }
}

/// In-memory evidence graph, the only shared mutable store in the core.
///
/// Per-key idempotence makes upserts commutative, so no locking beyond the
/// single store lock is needed.
pub struct InMemoryGraphStore {
    inner: RwLock<GraphInner>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(GraphInner::default()),
        }
    }

    /// Total node count, for tests and stats.
    pub async fn node_count(&self) -> usize {
        self.inner.read().await.entities.len()
    }

    /// Total edge count, for tests and stats.
    pub async fn edge_count(&self) -> usize {
        self.inner.read().await.edges.len()
    }
}

impl Default for InMemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn register_incident(
        &self,
        incident_id: Uuid,
        cluster: &str,
        namespace: &str,
        attrs: HashMap<String, serde_json::Value>,
    ) -> Result<Uuid, GraphError> {
        let key = EntityKey::new(
            cluster,
            namespace,
            EntityKind::Incident,
            &incident_id.to_string(),
        );
        let mut inner = self.inner.write().await;
        let node_id = inner.upsert(key, attrs);
        inner.incidents.insert(incident_id, node_id);
        debug!(%incident_id, %node_id, "registered incident node");
        Ok(node_id)
    }

    async fn upsert_entity(
        &self,
        key: EntityKey,
        attrs: HashMap<String, serde_json::Value>,
    ) -> Result<Uuid, GraphError> {
        let mut inner = self.inner.write().await;
        Ok(inner.upsert(key, attrs))
    }

    async fn link(
        &self,
        from: Uuid,
        to: Uuid,
        relation: RelationType,
        props: HashMap<String, serde_json::Value>,
    ) -> Result<(), GraphError> {
        let mut inner = self.inner.write().await;
        inner.link(from, to, relation, props)
    }

    async fn link_incident_to_entity(
        &self,
        incident_id: Uuid,
        entity_id: Uuid,
        relation: RelationType,
        props: HashMap<String, serde_json::Value>,
    ) -> Result<(), GraphError> {
        let mut inner = self.inner.write().await;
        let incident_node = *inner
            .incidents
            .get(&incident_id)
            .ok_or(GraphError::IncidentNotRegistered(incident_id))?;
        inner.link(incident_node, entity_id, relation, props)
    }

    async fn attach_evidence(
        &self,
        incident_id: Uuid,
        evidence: &Evidence,
        about: Option<EntityKey>,
    ) -> Result<Uuid, GraphError> {
        let record = serde_json::to_value(evidence)?;
        let mut inner = self.inner.write().await;
        let incident_node = *inner
            .incidents
            .get(&incident_id)
            .ok_or(GraphError::IncidentNotRegistered(incident_id))?;

        let incident_cluster = inner.entities[&incident_node].key.cluster.clone();
        let evidence_key = EntityKey::new(
            &incident_cluster,
            &evidence.entity_namespace,
            EntityKind::Evidence,
            &evidence.id.to_string(),
        );
        let mut attrs = HashMap::new();
        attrs.insert("record".to_string(), record);
        attrs.insert(
            "signal_strength".to_string(),
            serde_json::json!(evidence.signal_strength),
        );
        let evidence_node = inner.upsert(evidence_key, attrs);
        inner.link(
            incident_node,
            evidence_node,
            RelationType::HasEvidence,
            HashMap::new(),
        )?;

        if let Some(about_key) = about {
            let about_node = inner.upsert(about_key, HashMap::new());
            inner.link(evidence_node, about_node, RelationType::About, HashMap::new())?;
        }

        Ok(evidence_node)
    }

    async fn subgraph(&self, incident_id: Uuid, depth: u32) -> Result<Subgraph, GraphError> {
        let depth = depth.min(MAX_SUBGRAPH_DEPTH);
        let inner = self.inner.read().await;
        let start = *inner
            .incidents
            .get(&incident_id)
            .ok_or(GraphError::IncidentNotRegistered(incident_id))?;

        let mut visited: HashSet<Uuid> = HashSet::new();
        let mut queue: VecDeque<(Uuid, u32)> = VecDeque::new();
        visited.insert(start);
        queue.push_back((start, 0));

        while let Some((node, d)) = queue.pop_front() {
            if d >= depth {
                continue;
            }
            if let Some(neighbors) = inner.adjacency.get(&node) {
                for &next in neighbors {
                    if visited.insert(next) {
                        queue.push_back((next, d + 1));
                    }
                }
            }
        }

        let nodes = visited
            .iter()
            .filter_map(|id| inner.entities.get(id).cloned())
            .collect();
        let edges = inner
            .edges
            .values()
            .filter(|e| visited.contains(&e.from) && visited.contains(&e.to))
            .cloned()
            .collect();

        Ok(Subgraph { nodes, edges })
    }

    async fn entity_id(&self, key: &EntityKey) -> Option<Uuid> {
        self.inner.read().await.by_key.get(key).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{signal, EvidenceData, EvidenceSource, TimeWindow};

    fn pod_key(name: &str) -> EntityKey {
        EntityKey::new("test-cluster", "payments", EntityKind::Pod, name)
    }

    fn attrs(pairs: &[(&str, serde_json::Value)]) -> HashMap<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_upsert_idempotent_on_key() {
        let store = InMemoryGraphStore::new();
        let a = store
            .upsert_entity(pod_key("api-7f"), attrs(&[("phase", serde_json::json!("Running"))]))
            .await
            .unwrap();
        let b = store
            .upsert_entity(pod_key("api-7f"), attrs(&[("phase", serde_json::json!("Failed"))]))
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(store.node_count().await, 1);
    }

    #[tokio::test]
    async fn test_upsert_merge_is_commutative() {
        // Disjoint scalars plus overlapping sets: A then B must equal B then A.
        let a = attrs(&[
            ("restart_count", serde_json::json!(3)),
            ("labels", serde_json::json!(["app=api", "tier=web"])),
        ]);
        let b = attrs(&[
            ("phase", serde_json::json!("Running")),
            ("labels", serde_json::json!(["tier=web", "env=prod"])),
        ]);

        let store_ab = InMemoryGraphStore::new();
        store_ab.upsert_entity(pod_key("p"), a.clone()).await.unwrap();
        let id_ab = store_ab.upsert_entity(pod_key("p"), b.clone()).await.unwrap();

        let store_ba = InMemoryGraphStore::new();
        store_ba.upsert_entity(pod_key("p"), b).await.unwrap();
        let id_ba = store_ba.upsert_entity(pod_key("p"), a).await.unwrap();

        let sub_ab = store_ab.inner.read().await.entities[&id_ab].attrs.clone();
        let sub_ba = store_ba.inner.read().await.entities[&id_ba].attrs.clone();

        assert_eq!(sub_ab["restart_count"], sub_ba["restart_count"]);
        assert_eq!(sub_ab["phase"], sub_ba["phase"]);
        let mut labels_ab: Vec<String> = sub_ab["labels"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        let mut labels_ba: Vec<String> = sub_ba["labels"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        labels_ab.sort();
        labels_ba.sort();
        assert_eq!(labels_ab, labels_ba);
        assert_eq!(labels_ab.len(), 3);
    }

    #[tokio::test]
    async fn test_scalar_last_writer_wins() {
        let store = InMemoryGraphStore::new();
        let id = store
            .upsert_entity(pod_key("p"), attrs(&[("phase", serde_json::json!("Pending"))]))
            .await
            .unwrap();
        store
            .upsert_entity(pod_key("p"), attrs(&[("phase", serde_json::json!("Running"))]))
            .await
            .unwrap();
        let phase = store.inner.read().await.entities[&id].attrs["phase"].clone();
        assert_eq!(phase, serde_json::json!("Running"));
    }

    #[tokio::test]
    async fn test_link_idempotent() {
        let store = InMemoryGraphStore::new();
        let pod = store.upsert_entity(pod_key("api-7f"), HashMap::new()).await.unwrap();
        let deploy = store
            .upsert_entity(
                EntityKey::new("test-cluster", "payments", EntityKind::Deployment, "api"),
                HashMap::new(),
            )
            .await
            .unwrap();
        store
            .link(pod, deploy, RelationType::PartOf, HashMap::new())
            .await
            .unwrap();
        store
            .link(pod, deploy, RelationType::PartOf, HashMap::new())
            .await
            .unwrap();
        assert_eq!(store.edge_count().await, 1);
    }

    #[tokio::test]
    async fn test_evidence_round_trip_through_subgraph() {
        let store = InMemoryGraphStore::new();
        let incident_id = Uuid::new_v4();
        store
            .register_incident(incident_id, "test-cluster", "payments", HashMap::new())
            .await
            .unwrap();

        let data = EvidenceData::PodState {
            name: "api-7f".to_string(),
            phase: "CrashLoopBackOff".to_string(),
            node_name: None,
            restart_count: 15,
            waiting_reason: Some("CrashLoopBackOff".to_string()),
            terminated_reason: None,
            ready: false,
        };
        let evidence = Evidence::new(
            incident_id,
            EvidenceSource::K8s,
            "api-7f",
            "payments",
            data.clone(),
            signal::TERMINAL,
            TimeWindow::last_minutes(15),
        );
        store
            .attach_evidence(incident_id, &evidence, Some(pod_key("api-7f")))
            .await
            .unwrap();

        let sub = store.subgraph(incident_id, 3).await.unwrap();
        let evidence_node = sub
            .nodes
            .iter()
            .find(|n| n.key.kind == EntityKind::Evidence)
            .expect("evidence node present");
        let stored: Evidence =
            serde_json::from_value(evidence_node.attrs["record"].clone()).unwrap();
        assert_eq!(stored.data, data);
        assert_eq!(stored.signal_strength, evidence.signal_strength);

        // Incident -> evidence -> pod, all inside depth 3.
        assert!(sub.nodes.iter().any(|n| n.key.kind == EntityKind::Pod));
        assert!(sub
            .edges
            .iter()
            .any(|e| e.relation == RelationType::HasEvidence));
        assert!(sub.edges.iter().any(|e| e.relation == RelationType::About));
    }

    #[tokio::test]
    async fn test_subgraph_depth_bounded() {
        let store = InMemoryGraphStore::new();
        let incident_id = Uuid::new_v4();
        let incident_node = store
            .register_incident(incident_id, "c", "ns", HashMap::new())
            .await
            .unwrap();

        // Chain: incident -> pod -> deployment -> hpa -> node (depth 4).
        let pod = store
            .upsert_entity(EntityKey::new("c", "ns", EntityKind::Pod, "p"), HashMap::new())
            .await
            .unwrap();
        let deploy = store
            .upsert_entity(
                EntityKey::new("c", "ns", EntityKind::Deployment, "d"),
                HashMap::new(),
            )
            .await
            .unwrap();
        let hpa = store
            .upsert_entity(EntityKey::new("c", "ns", EntityKind::Hpa, "h"), HashMap::new())
            .await
            .unwrap();
        let node = store
            .upsert_entity(
                EntityKey::cluster_scoped("c", EntityKind::Node, "n1"),
                HashMap::new(),
            )
            .await
            .unwrap();
        store
            .link(incident_node, pod, RelationType::Affects, HashMap::new())
            .await
            .unwrap();
        store.link(pod, deploy, RelationType::PartOf, HashMap::new()).await.unwrap();
        store.link(deploy, hpa, RelationType::ScaledBy, HashMap::new()).await.unwrap();
        store.link(hpa, node, RelationType::ScheduledOn, HashMap::new()).await.unwrap();

        let sub = store.subgraph(incident_id, 10).await.unwrap();
        // Depth clamps to 3: node at depth 4 is excluded.
        assert_eq!(sub.nodes.len(), 4);
        assert!(!sub.nodes.iter().any(|n| n.key.kind == EntityKind::Node));
    }

    #[tokio::test]
    async fn test_link_unknown_entity_fails() {
        let store = InMemoryGraphStore::new();
        let pod = store.upsert_entity(pod_key("p"), HashMap::new()).await.unwrap();
        let result = store
            .link(pod, Uuid::new_v4(), RelationType::PartOf, HashMap::new())
            .await;
        assert!(matches!(result, Err(GraphError::EntityNotFound(_))));
    }
}
