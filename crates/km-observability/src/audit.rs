//! Audit log.
//!
//! A bounded in-memory audit trail for policy evaluations, approval
//! decisions, and action executions. Entries are queryable by incident so a
//! denied or timed-out remediation is explainable after the fact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// What kind of event the entry records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    PolicyEvaluated,
    ApprovalRequested,
    ApprovalDecided,
    ActionExecuted,
    VerificationCompleted,
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub kind: AuditKind,
    /// Short human-readable outcome, e.g. "deny" or "approved".
    pub outcome: String,
    /// Structured payload (policy inputs, matched rules, execution result).
    pub detail: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        incident_id: Uuid,
        kind: AuditKind,
        outcome: &str,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            incident_id,
            kind,
            outcome: outcome.to_string(),
            detail,
            recorded_at: Utc::now(),
        }
    }
}

/// Bounded, append-only audit log.
pub struct AuditLog {
    entries: RwLock<VecDeque<AuditRecord>>,
    capacity: usize,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity,
        }
    }

    /// Appends a record, evicting the oldest past capacity.
    pub async fn log(&self, record: AuditRecord) {
        info!(
            incident_id = %record.incident_id,
            kind = ?record.kind,
            outcome = %record.outcome,
            "audit record"
        );
        let mut entries = self.entries.write().await;
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(record);
    }

    pub async fn entries(&self) -> Vec<AuditRecord> {
        self.entries.read().await.iter().cloned().collect()
    }

    pub async fn for_incident(&self, incident_id: Uuid) -> Vec<AuditRecord> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|r| r.incident_id == incident_id)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(10_000)
    }
}
