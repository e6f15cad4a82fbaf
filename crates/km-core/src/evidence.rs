//! Evidence models for Kube Medic.
//!
//! Evidence is a single observation relevant to an incident, collected from
//! the cluster API, the log backend, the metrics backend, or deploy history.
//! Payloads are tagged variants keyed by evidence type rather than an untyped
//! bag, so downstream signal extraction stays total.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Signal-strength rubric shared by all collectors.
///
/// Collectors assign these; nothing downstream mutates them.
pub mod signal {
    /// Unambiguous terminal state (OOMKilled, ImagePullBackOff present).
    pub const TERMINAL: f64 = 1.0;
    /// Crash correlated with a recent deploy.
    pub const DEPLOY_CORRELATED: f64 = 0.9;
    /// High restart delta.
    pub const HIGH_RESTARTS: f64 = 0.7;
    /// Default presence.
    pub const PRESENT: f64 = 0.5;
    /// Merely informational state.
    pub const INFORMATIONAL: f64 = 0.2;
}

/// Types of evidence the collectors can produce.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceType {
    PodState,
    ContainerState,
    DeployHistory,
    LogsPattern,
    MetricSample,
    NodeState,
    HpaState,
    Events,
}

/// Sources evidence is collected from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceSource {
    K8s,
    Logs,
    Metrics,
    Deploy,
}

/// The fixed metric query family evaluated by the metrics collector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    RestartCountDelta,
    MemoryUsageRatio,
    CpuThrottleRate,
    Http5xxRate,
    P99Latency,
    HpaUtilization,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MetricKind::RestartCountDelta => "restart_count_delta",
            MetricKind::MemoryUsageRatio => "memory_usage_ratio",
            MetricKind::CpuThrottleRate => "cpu_throttle_rate",
            MetricKind::Http5xxRate => "http_5xx_rate",
            MetricKind::P99Latency => "p99_latency",
            MetricKind::HpaUtilization => "hpa_utilization",
        };
        write!(f, "{}", s)
    }
}

/// Regex classes the logs collector counts matches for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LogPatternClass {
    Error,
    Panic,
    Oom,
    ConnectionRefused,
    Timeout,
    Http5xx,
}

/// One Kubernetes event relevant to the incident.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub reason: String,
    pub object_kind: String,
    pub object_name: String,
    pub message: String,
    pub count: u32,
    pub last_seen: DateTime<Utc>,
}

/// Structured evidence payload, keyed by evidence type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvidenceData {
    PodState {
        name: String,
        phase: String,
        node_name: Option<String>,
        restart_count: u32,
        waiting_reason: Option<String>,
        terminated_reason: Option<String>,
        ready: bool,
    },
    ContainerState {
        pod: String,
        container: String,
        waiting_reason: Option<String>,
        terminated_reason: Option<String>,
        restart_count: u32,
        last_exit_code: Option<i32>,
    },
    DeployHistory {
        deployment: String,
        current_revision: i64,
        previous_revision: Option<i64>,
        current_images: Vec<String>,
        previous_images: Vec<String>,
        image_changed: bool,
        config_hash_changed: bool,
        deployed_at: Option<DateTime<Utc>>,
        is_recent: bool,
    },
    LogsPattern {
        total_lines: usize,
        error_count: usize,
        patterns: Vec<LogPatternClass>,
        error_rate_per_minute: f64,
        sample_stack_traces: Vec<String>,
    },
    MetricSample {
        metric: MetricKind,
        value: f64,
    },
    NodeState {
        name: String,
        ready: bool,
        disk_pressure: bool,
        memory_pressure: bool,
        pid_pressure: bool,
        unschedulable: bool,
        pod_failures: u32,
    },
    HpaState {
        name: String,
        current_replicas: u32,
        min_replicas: u32,
        max_replicas: u32,
        at_max: bool,
        target_deployment: String,
    },
    Events {
        records: Vec<EventRecord>,
    },
}

impl EvidenceData {
    /// Returns the evidence type this payload belongs to.
    pub fn evidence_type(&self) -> EvidenceType {
        match self {
            EvidenceData::PodState { .. } => EvidenceType::PodState,
            EvidenceData::ContainerState { .. } => EvidenceType::ContainerState,
            EvidenceData::DeployHistory { .. } => EvidenceType::DeployHistory,
            EvidenceData::LogsPattern { .. } => EvidenceType::LogsPattern,
            EvidenceData::MetricSample { .. } => EvidenceType::MetricSample,
            EvidenceData::NodeState { .. } => EvidenceType::NodeState,
            EvidenceData::HpaState { .. } => EvidenceType::HpaState,
            EvidenceData::Events { .. } => EvidenceType::Events,
        }
    }
}

/// Time window evidence was collected over.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Window ending now and reaching back the given number of minutes.
    pub fn last_minutes(minutes: i64) -> Self {
        let end = Utc::now();
        Self {
            start: end - Duration::minutes(minutes),
            end,
        }
    }

    /// Window from the incident start minus a lookback, ending now.
    pub fn around(started_at: DateTime<Utc>, lookback_minutes: i64) -> Self {
        Self {
            start: started_at - Duration::minutes(lookback_minutes),
            end: Utc::now(),
        }
    }

    pub fn duration_minutes(&self) -> f64 {
        (self.end - self.start).num_seconds() as f64 / 60.0
    }
}

/// A single observation attached to an incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    /// Unique identifier.
    pub id: Uuid,
    /// Incident this evidence belongs to. Evidence belongs to exactly one.
    pub incident_id: Uuid,
    /// Type tag, always consistent with `data`.
    pub evidence_type: EvidenceType,
    /// Which backend produced it.
    pub source: EvidenceSource,
    /// Name of the observed entity (pod, deployment, node, ...).
    pub entity_name: String,
    /// Namespace of the observed entity.
    pub entity_namespace: String,
    /// Structured payload.
    pub data: EvidenceData,
    /// Relevance in [0, 1], assigned by the collector and never mutated.
    pub signal_strength: f64,
    /// Human-readable one-liner.
    pub summary: Option<String>,
    /// Set when the collector hit its deadline and returned a truncated set.
    pub partial: bool,
    pub collected_at: DateTime<Utc>,
    pub time_window: TimeWindow,
}

impl Evidence {
    /// Creates evidence, deriving the type tag and clamping signal strength.
    pub fn new(
        incident_id: Uuid,
        source: EvidenceSource,
        entity_name: &str,
        entity_namespace: &str,
        data: EvidenceData,
        signal_strength: f64,
        time_window: TimeWindow,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            incident_id,
            evidence_type: data.evidence_type(),
            source,
            entity_name: entity_name.to_string(),
            entity_namespace: entity_namespace.to_string(),
            data,
            signal_strength: signal_strength.clamp(0.0, 1.0),
            summary: None,
            partial: false,
            collected_at: Utc::now(),
            time_window,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn partial(mut self) -> Self {
        self.partial = true;
        self
    }
}

/// Everything one collector run produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectorOutput {
    /// Registry name of the collector.
    pub collector: String,
    pub evidence: Vec<Evidence>,
    /// Graph nodes observed alongside the evidence.
    pub entities: Vec<crate::graph::EntityDraft>,
    /// Graph edges observed alongside the evidence.
    pub relations: Vec<crate::graph::RelationDraft>,
    /// True when the collector hit its deadline or swallowed an error.
    pub partial: bool,
    pub errors: Vec<String>,
}

impl CollectorOutput {
    pub fn new(collector: &str) -> Self {
        Self {
            collector: collector.to_string(),
            ..Default::default()
        }
    }

    /// Output representing a collector that timed out before producing anything.
    pub fn timed_out(collector: &str) -> Self {
        let mut out = Self::new(collector);
        out.partial = true;
        out.errors.push("deadline exceeded".to_string());
        out
    }
}
