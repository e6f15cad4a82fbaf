//! Workflow journal.
//!
//! The durability backbone of the incident workflow: every state transition
//! and every non-pure activity result is appended here before downstream
//! steps observe it. After a crash-restart the driver replays the journal
//! and resumes at the next suspension point without re-executing completed
//! activities.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use km_core::{FailureReason, IncidentStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Errors from journal storage.
#[derive(Error, Debug)]
pub enum JournalError {
    #[error("Journal storage error: {0}")]
    Storage(String),

    #[error("Journal serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One journaled event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum JournalEntry {
    StatusChanged {
        from: IncidentStatus,
        to: IncidentStatus,
        at: DateTime<Utc>,
    },
    ActivityCompleted {
        key: String,
        result: serde_json::Value,
        at: DateTime<Utc>,
    },
    WorkflowFailed {
        reason: FailureReason,
        at: DateTime<Utc>,
    },
}

impl JournalEntry {
    pub fn status(from: IncidentStatus, to: IncidentStatus) -> Self {
        JournalEntry::StatusChanged {
            from,
            to,
            at: Utc::now(),
        }
    }

    pub fn activity(key: &str, result: serde_json::Value) -> Self {
        JournalEntry::ActivityCompleted {
            key: key.to_string(),
            result,
            at: Utc::now(),
        }
    }

    pub fn failed(reason: FailureReason) -> Self {
        JournalEntry::WorkflowFailed {
            reason,
            at: Utc::now(),
        }
    }
}

/// Append-only journal storage, keyed by incident.
#[async_trait]
pub trait WorkflowJournal: Send + Sync {
    async fn append(&self, incident_id: Uuid, entry: JournalEntry) -> Result<(), JournalError>;

    async fn load(&self, incident_id: Uuid) -> Result<Vec<JournalEntry>, JournalError>;

    /// Returns the most recent journaled result for an activity key.
    async fn find_activity(
        &self,
        incident_id: Uuid,
        key: &str,
    ) -> Result<Option<serde_json::Value>, JournalError> {
        Ok(self
            .load(incident_id)
            .await?
            .into_iter()
            .rev()
            .find_map(|entry| match entry {
                JournalEntry::ActivityCompleted { key: k, result, .. } if k == key => Some(result),
                _ => None,
            }))
    }
}

/// In-memory journal. Production deployments put a durable store behind the
/// same trait; the workflow logic is identical.
pub struct InMemoryJournal {
    entries: RwLock<HashMap<Uuid, Vec<JournalEntry>>>,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self, incident_id: Uuid) -> usize {
        self.entries
            .read()
            .await
            .get(&incident_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Default for InMemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowJournal for InMemoryJournal {
    async fn append(&self, incident_id: Uuid, entry: JournalEntry) -> Result<(), JournalError> {
        self.entries
            .write()
            .await
            .entry(incident_id)
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn load(&self, incident_id: Uuid) -> Result<Vec<JournalEntry>, JournalError> {
        Ok(self
            .entries
            .read()
            .await
            .get(&incident_id)
            .cloned()
            .unwrap_or_default())
    }
}
