//! Incident data models for Kube Medic.
//!
//! This module defines the core incident representation, its lifecycle state
//! machine, and the normalized alert input from which incidents are created.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Severity levels for incidents, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational, no action expected.
    Info,
    /// Needs attention but not urgent.
    Warning,
    /// Service-impacting.
    Critical,
    /// Wake someone up.
    Page,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
            Severity::Page => write!(f, "page"),
        }
    }
}

/// Status of an incident in the remediation workflow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    /// Newly created, workflow not yet started.
    Open,
    /// Evidence is being collected and analyzed.
    Investigating,
    /// A remediation action is proposed or executing.
    Remediating,
    /// Waiting on a human approval decision.
    AwaitingApproval,
    /// Remediation executed, waiting to confirm recovery.
    Verifying,
    /// Incident is resolved.
    Resolved,
    /// Workflow gave up on this incident.
    Failed,
}

impl IncidentStatus {
    /// Returns true for statuses the workflow never leaves on its own.
    ///
    /// `Failed` is terminal for the workflow run but may re-enter
    /// `Remediating` while the retry budget allows another attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, IncidentStatus::Resolved)
    }

    /// Checks whether a transition to `to` is legal from this status.
    pub fn can_transition(&self, to: IncidentStatus) -> bool {
        use IncidentStatus::*;
        match (*self, to) {
            (Open, Investigating) => true,
            (Investigating, Remediating) => true,
            (Remediating, AwaitingApproval) => true,
            (Remediating, Verifying) => true,
            (AwaitingApproval, Remediating) => true,
            (Verifying, Remediating) => true,
            (Failed, Remediating) => true,
            // External ack resolves from any live status.
            (from, Resolved) if !from.is_terminal() => true,
            // Cancellation, denial, timeouts.
            (from, Failed) if !from.is_terminal() && from != Failed => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IncidentStatus::Open => write!(f, "open"),
            IncidentStatus::Investigating => write!(f, "investigating"),
            IncidentStatus::Remediating => write!(f, "remediating"),
            IncidentStatus::AwaitingApproval => write!(f, "awaiting_approval"),
            IncidentStatus::Verifying => write!(f, "verifying"),
            IncidentStatus::Resolved => write!(f, "resolved"),
            IncidentStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Why a workflow ended in `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The policy gate denied the only viable remediation.
    PolicyDenied,
    /// No approval decision arrived before the deadline.
    ApprovalTimeout,
    /// The executor exhausted its retries.
    ExecutionFailed,
    /// Post-remediation metrics did not recover.
    VerificationFailed,
    /// An external cancel signal was observed.
    Cancelled,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::PolicyDenied => write!(f, "policy_denied"),
            FailureReason::ApprovalTimeout => write!(f, "approval_timeout"),
            FailureReason::ExecutionFailed => write!(f, "execution_failed"),
            FailureReason::VerificationFailed => write!(f, "verification_failed"),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Source systems that can deliver alerts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertSource {
    Alertmanager,
    Grafana,
    Prometheus,
    Manual,
    Synthetic,
}

/// Normalized alert payload from the monitoring system.
///
/// `fingerprint` may be supplied by the sender; when absent a stable hash of
/// the identifying fields is derived so retransmitted alerts deduplicate to
/// the same incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Deduplication key, if the sender provides one.
    pub fingerprint: Option<String>,
    /// Human-readable alert title.
    pub title: String,
    /// Severity level.
    pub severity: Severity,
    /// Source system.
    pub source: AlertSource,
    /// Kubernetes cluster name.
    pub cluster: String,
    /// Kubernetes namespace.
    pub namespace: String,
    /// Affected service, when known.
    pub service: Option<String>,
    /// Alert labels.
    pub labels: BTreeMap<String, String>,
    /// Alert annotations.
    pub annotations: BTreeMap<String, String>,
    /// When the underlying condition started.
    pub started_at: DateTime<Utc>,
}

impl Alert {
    /// Returns the supplied fingerprint or derives a stable one.
    pub fn resolve_fingerprint(&self) -> String {
        match &self.fingerprint {
            Some(fp) if !fp.is_empty() => fp.clone(),
            _ => derive_fingerprint(self),
        }
    }
}

/// Derives a stable fingerprint from the alert's identifying fields.
///
/// The hash covers `(alertname, cluster, namespace, service, labels)` so two
/// alerts describing the same ongoing condition collapse to one incident.
pub fn derive_fingerprint(alert: &Alert) -> String {
    let mut hasher = Sha256::new();
    let alertname = alert
        .labels
        .get("alertname")
        .map(String::as_str)
        .unwrap_or(alert.title.as_str());
    hasher.update(alertname.as_bytes());
    hasher.update(b"|");
    hasher.update(alert.cluster.as_bytes());
    hasher.update(b"|");
    hasher.update(alert.namespace.as_bytes());
    hasher.update(b"|");
    hasher.update(alert.service.as_deref().unwrap_or("").as_bytes());
    // BTreeMap iteration is ordered, so the digest is stable.
    for (k, v) in &alert.labels {
        hasher.update(b"|");
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// The deduplicated, persistent representation of one ongoing issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    /// Unique identifier.
    pub id: Uuid,
    /// Globally unique deduplication key.
    pub fingerprint: String,
    /// Human-readable title.
    pub title: String,
    /// Severity level.
    pub severity: Severity,
    /// Current workflow status.
    pub status: IncidentStatus,
    /// Why the incident failed, when `status` is `Failed`.
    pub failure_reason: Option<FailureReason>,
    /// Source system.
    pub source: AlertSource,
    /// Kubernetes cluster name.
    pub cluster: String,
    /// Kubernetes namespace.
    pub namespace: String,
    /// Affected service, when known.
    pub service: Option<String>,
    /// Alert labels.
    pub labels: BTreeMap<String, String>,
    /// Alert annotations.
    pub annotations: BTreeMap<String, String>,
    /// When the underlying condition started.
    pub started_at: DateTime<Utc>,
    /// When an operator acknowledged the incident.
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// When the incident was resolved.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Audit trail of everything that happened to this incident.
    pub audit_log: Vec<AuditEntry>,
}

impl Incident {
    /// Creates a new incident from a normalized alert.
    pub fn from_alert(alert: Alert) -> Self {
        let fingerprint = alert.resolve_fingerprint();
        Self {
            id: Uuid::new_v4(),
            fingerprint,
            title: alert.title,
            severity: alert.severity,
            status: IncidentStatus::Open,
            failure_reason: None,
            source: alert.source,
            cluster: alert.cluster,
            namespace: alert.namespace,
            service: alert.service,
            labels: alert.labels,
            annotations: alert.annotations,
            started_at: alert.started_at,
            acknowledged_at: None,
            resolved_at: None,
            audit_log: vec![AuditEntry::new(AuditAction::IncidentCreated, "system")],
        }
    }

    /// Applies a status transition, recording it in the audit trail.
    ///
    /// Returns `false` and leaves the incident unchanged when the transition
    /// is not legal.
    pub fn transition(&mut self, to: IncidentStatus, actor: &str) -> bool {
        if !self.status.can_transition(to) {
            return false;
        }
        self.status = to;
        if to == IncidentStatus::Resolved {
            let now = Utc::now();
            // resolved_at must never precede started_at.
            self.resolved_at = Some(now.max(self.started_at));
        }
        self.audit_log
            .push(AuditEntry::new(AuditAction::StatusChanged(to), actor));
        true
    }

    /// Marks the incident failed with a reason.
    pub fn fail(&mut self, reason: FailureReason, actor: &str) -> bool {
        if !self.transition(IncidentStatus::Failed, actor) {
            return false;
        }
        self.failure_reason = Some(reason);
        true
    }

    /// Resolves the incident from an external acknowledgement.
    pub fn resolve_external(&mut self, actor: &str, note: Option<&str>) -> bool {
        if !self.transition(IncidentStatus::Resolved, actor) {
            return false;
        }
        self.acknowledged_at = Some(Utc::now());
        if let Some(note) = note {
            self.audit_log.push(AuditEntry::new(
                AuditAction::NoteAdded(note.to_string()),
                actor,
            ));
        }
        true
    }

    /// Appends an arbitrary audit action.
    pub fn record(&mut self, action: AuditAction, actor: &str) {
        self.audit_log.push(AuditEntry::new(action, actor));
    }

    /// A short selector context used by collectors and the executor.
    pub fn selector(&self) -> (&str, Option<&str>) {
        (&self.namespace, self.service.as_deref())
    }
}

/// Audit log entry on an incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub action: AuditAction,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(action: AuditAction, actor: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            actor: actor.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Actions recorded in the incident audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    IncidentCreated,
    StatusChanged(IncidentStatus),
    EvidenceAttached { count: usize },
    HypothesesRanked { count: usize },
    ActionProposed { action_id: Uuid },
    ActionApproved { action_id: Uuid, approver: String },
    ActionDenied { action_id: Uuid, reason: String },
    ActionExecuted { action_id: Uuid },
    ActionFailed { action_id: Uuid, reason: String },
    VerificationRecorded { action_id: Uuid, success: bool },
    NoteAdded(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_alert() -> Alert {
        let mut labels = BTreeMap::new();
        labels.insert("alertname".to_string(), "PodCrashLooping".to_string());
        labels.insert("pod".to_string(), "api-7f".to_string());
        Alert {
            fingerprint: None,
            title: "Pod CrashLoopBackOff: api-7f".to_string(),
            severity: Severity::Critical,
            source: AlertSource::Alertmanager,
            cluster: "prod-us-east-1".to_string(),
            namespace: "payments".to_string(),
            service: Some("api".to_string()),
            labels,
            annotations: BTreeMap::new(),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_incident_from_alert() {
        let incident = Incident::from_alert(sample_alert());
        assert_eq!(incident.status, IncidentStatus::Open);
        assert_eq!(incident.severity, Severity::Critical);
        assert!(!incident.fingerprint.is_empty());
        assert_eq!(incident.audit_log.len(), 1);
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = sample_alert();
        let b = sample_alert();
        assert_eq!(derive_fingerprint(&a), derive_fingerprint(&b));

        let mut c = sample_alert();
        c.namespace = "checkout".to_string();
        assert_ne!(derive_fingerprint(&a), derive_fingerprint(&c));
    }

    #[test]
    fn test_supplied_fingerprint_wins() {
        let mut alert = sample_alert();
        alert.fingerprint = Some("explicit-key".to_string());
        assert_eq!(alert.resolve_fingerprint(), "explicit-key");
    }

    #[test]
    fn test_legal_transitions() {
        let mut incident = Incident::from_alert(sample_alert());
        assert!(incident.transition(IncidentStatus::Investigating, "workflow"));
        assert!(incident.transition(IncidentStatus::Remediating, "workflow"));
        assert!(incident.transition(IncidentStatus::AwaitingApproval, "workflow"));
        assert!(incident.transition(IncidentStatus::Remediating, "workflow"));
        assert!(incident.transition(IncidentStatus::Verifying, "workflow"));
        assert!(incident.transition(IncidentStatus::Resolved, "workflow"));
        assert_eq!(incident.status, IncidentStatus::Resolved);
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut incident = Incident::from_alert(sample_alert());
        assert!(!incident.transition(IncidentStatus::Verifying, "workflow"));
        assert_eq!(incident.status, IncidentStatus::Open);
    }

    #[test]
    fn test_failed_can_reenter_remediating() {
        let mut incident = Incident::from_alert(sample_alert());
        incident.transition(IncidentStatus::Investigating, "workflow");
        incident.transition(IncidentStatus::Remediating, "workflow");
        assert!(incident.fail(FailureReason::ExecutionFailed, "workflow"));
        assert!(incident.transition(IncidentStatus::Remediating, "workflow"));
    }

    #[test]
    fn test_resolved_is_terminal() {
        let mut incident = Incident::from_alert(sample_alert());
        incident.transition(IncidentStatus::Investigating, "workflow");
        incident.transition(IncidentStatus::Resolved, "operator");
        assert!(!incident.transition(IncidentStatus::Remediating, "workflow"));
        assert!(!incident.fail(FailureReason::Cancelled, "workflow"));
    }

    #[test]
    fn test_external_ack_from_any_live_status() {
        let mut incident = Incident::from_alert(sample_alert());
        incident.transition(IncidentStatus::Investigating, "workflow");
        incident.transition(IncidentStatus::Remediating, "workflow");
        incident.transition(IncidentStatus::AwaitingApproval, "workflow");
        assert!(incident.resolve_external("oncall", Some("fixed by hand")));
        assert_eq!(incident.status, IncidentStatus::Resolved);
        assert!(incident.acknowledged_at.is_some());
    }

    #[test]
    fn test_resolved_at_not_before_started_at() {
        let mut alert = sample_alert();
        alert.started_at = Utc::now() + chrono::Duration::seconds(30);
        let mut incident = Incident::from_alert(alert);
        incident.transition(IncidentStatus::Investigating, "workflow");
        incident.transition(IncidentStatus::Resolved, "workflow");
        assert!(incident.resolved_at.unwrap() >= incident.started_at);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Page > Severity::Critical);
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }
}
