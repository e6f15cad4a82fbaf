//! Incident orchestrator.
//!
//! Owns alert ingestion and deduplication: two alerts with the same
//! fingerprint map to the same live incident and therefore the same
//! workflow. Each workflow gets a cancellation switch observed at every
//! suspension point.

use crate::driver::{ActivityRetry, IncidentWorkflow, WorkflowDeps, WorkflowError, WorkflowOutcome};
use km_core::{Alert, AppConfig, Incident, IncidentStatus};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Errors from the orchestrator.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Incident not found: {0}")]
    IncidentNotFound(Uuid),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),
}

/// Result of ingesting an alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new incident was created.
    Created(Uuid),
    /// The alert deduplicated onto an existing live incident.
    Duplicate(Uuid),
}

impl IngestOutcome {
    pub fn incident_id(&self) -> Uuid {
        match self {
            IngestOutcome::Created(id) | IngestOutcome::Duplicate(id) => *id,
        }
    }
}

/// Counters over the orchestrator's lifetime.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorStats {
    pub alerts_received: u64,
    pub incidents_created: u64,
    pub alerts_deduplicated: u64,
    pub incidents_resolved: u64,
    pub incidents_failed: u64,
}

/// The orchestrator: dedup, workflow launch, cancellation.
pub struct Orchestrator {
    deps: WorkflowDeps,
    config: AppConfig,
    activity_retry: ActivityRetry,
    incidents: RwLock<HashMap<Uuid, Incident>>,
    fingerprints: RwLock<HashMap<String, Uuid>>,
    cancels: RwLock<HashMap<Uuid, watch::Sender<bool>>>,
    stats: RwLock<OrchestratorStats>,
}

impl Orchestrator {
    pub fn new(deps: WorkflowDeps, config: AppConfig) -> Self {
        Self {
            deps,
            config,
            activity_retry: ActivityRetry::default(),
            incidents: RwLock::new(HashMap::new()),
            fingerprints: RwLock::new(HashMap::new()),
            cancels: RwLock::new(HashMap::new()),
            stats: RwLock::new(OrchestratorStats::default()),
        }
    }

    /// Overrides the activity retry policy for workflows this orchestrator
    /// launches (tests use `ActivityRetry::fast`).
    pub fn with_activity_retry(mut self, retry: ActivityRetry) -> Self {
        self.activity_retry = retry;
        self
    }

    /// Ingests a normalized alert, deduplicating by fingerprint.
    ///
    /// A fingerprint maps to the same incident for as long as that incident
    /// is live; once it reaches resolved or failed, a fresh alert opens a
    /// new incident.
    #[instrument(skip(self, alert), fields(title = %alert.title))]
    pub async fn ingest_alert(&self, alert: Alert) -> IngestOutcome {
        self.stats.write().await.alerts_received += 1;
        let fingerprint = alert.resolve_fingerprint();

        {
            let fingerprints = self.fingerprints.read().await;
            if let Some(&existing_id) = fingerprints.get(&fingerprint) {
                let incidents = self.incidents.read().await;
                if let Some(existing) = incidents.get(&existing_id) {
                    let live = !matches!(
                        existing.status,
                        IncidentStatus::Resolved | IncidentStatus::Failed
                    );
                    if live {
                        info!(%fingerprint, incident_id = %existing_id, "alert deduplicated");
                        self.stats.write().await.alerts_deduplicated += 1;
                        return IngestOutcome::Duplicate(existing_id);
                    }
                }
            }
        }

        let incident = Incident::from_alert(alert);
        let incident_id = incident.id;
        info!(%fingerprint, %incident_id, "incident created");
        self.fingerprints
            .write()
            .await
            .insert(fingerprint, incident_id);
        self.incidents.write().await.insert(incident_id, incident);
        self.stats.write().await.incidents_created += 1;
        IngestOutcome::Created(incident_id)
    }

    /// Runs the workflow for an incident to a terminal state.
    #[instrument(skip(self))]
    pub async fn run_incident(
        &self,
        incident_id: Uuid,
    ) -> Result<WorkflowOutcome, OrchestratorError> {
        let mut incident = self
            .incidents
            .read()
            .await
            .get(&incident_id)
            .cloned()
            .ok_or(OrchestratorError::IncidentNotFound(incident_id))?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancels.write().await.insert(incident_id, cancel_tx);

        let workflow = IncidentWorkflow::new(self.deps.clone(), self.config.clone(), cancel_rx)
            .with_activity_retry(self.activity_retry.clone());
        let result = workflow.run(&mut incident).await;
        self.cancels.write().await.remove(&incident_id);
        let outcome = result?;

        {
            let mut incidents = self.incidents.write().await;
            // An external ack may have resolved the incident while the
            // workflow was winding down; that resolution wins.
            let externally_resolved = incidents
                .get(&incident_id)
                .map(|stored| stored.status == IncidentStatus::Resolved)
                .unwrap_or(false);
            if !externally_resolved {
                incidents.insert(incident_id, incident);
            }
        }
        {
            let mut stats = self.stats.write().await;
            match outcome.final_status {
                IncidentStatus::Resolved => stats.incidents_resolved += 1,
                IncidentStatus::Failed => stats.incidents_failed += 1,
                _ => {}
            }
        }
        Ok(outcome)
    }

    /// Raises the cancellation signal for a running workflow.
    pub async fn cancel_incident(&self, incident_id: Uuid) -> bool {
        match self.cancels.read().await.get(&incident_id) {
            Some(sender) => {
                warn!(%incident_id, "cancellation requested");
                sender.send(true).is_ok()
            }
            None => false,
        }
    }

    /// Resolves an incident from an external acknowledgement and cancels
    /// any workflow still running for it.
    pub async fn resolve_external(
        &self,
        incident_id: Uuid,
        actor: &str,
        note: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        {
            let mut incidents = self.incidents.write().await;
            let incident = incidents
                .get_mut(&incident_id)
                .ok_or(OrchestratorError::IncidentNotFound(incident_id))?;
            incident.resolve_external(actor, note);
        }
        self.cancel_incident(incident_id).await;
        self.stats.write().await.incidents_resolved += 1;
        Ok(())
    }

    pub async fn get_incident(&self, incident_id: Uuid) -> Option<Incident> {
        self.incidents.read().await.get(&incident_id).cloned()
    }

    pub async fn stats(&self) -> OrchestratorStats {
        self.stats.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SystemClock;
    use crate::journal::InMemoryJournal;
    use chrono::Utc;
    use km_actions::ExecutorConfig;
    use km_connectors::{MockClusterConnector, MockLogsConnector, MockMetricsConnector};
    use km_core::{AlertSource, InMemoryGraphStore, RulesEngine, Severity, VerificationConfig};
    use km_observability::AuditLog;
    use km_policy::MockApprovalChannel;
    use std::sync::Arc;

    fn test_deps() -> WorkflowDeps {
        let cluster = Arc::new(MockClusterConnector::with_sample_data("payments", "api"));
        let logs = Arc::new(MockLogsConnector::new());
        let metrics = Arc::new(MockMetricsConnector::new());
        WorkflowDeps {
            graph: Arc::new(InMemoryGraphStore::new()),
            collectors: Arc::new(km_collectors::default_registry(
                cluster.clone(),
                logs,
                metrics.clone(),
            )),
            rules: Arc::new(RulesEngine::default()),
            enricher: None,
            approvals: Arc::new(MockApprovalChannel::approving("oncall")),
            actions: Arc::new(km_actions::default_registry(
                cluster.clone(),
                ExecutorConfig::fast(),
            )),
            verifier: Arc::new(km_actions::Verifier::new(
                cluster,
                metrics,
                VerificationConfig::default(),
            )),
            journal: Arc::new(InMemoryJournal::new()),
            audit: Arc::new(AuditLog::default()),
            clock: Arc::new(SystemClock),
        }
    }

    fn alert(fingerprint: &str) -> Alert {
        Alert {
            fingerprint: Some(fingerprint.to_string()),
            title: "Pod CrashLoopBackOff: api".to_string(),
            severity: Severity::Critical,
            source: AlertSource::Alertmanager,
            cluster: "test-cluster".to_string(),
            namespace: "payments".to_string(),
            service: Some("api".to_string()),
            labels: Default::default(),
            annotations: Default::default(),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_same_fingerprint_deduplicates() {
        let orchestrator = Orchestrator::new(test_deps(), AppConfig::default());

        let first = orchestrator.ingest_alert(alert("fp-1")).await;
        let second = orchestrator.ingest_alert(alert("fp-1")).await;

        assert!(matches!(first, IngestOutcome::Created(_)));
        assert_eq!(second, IngestOutcome::Duplicate(first.incident_id()));

        let stats = orchestrator.stats().await;
        assert_eq!(stats.alerts_received, 2);
        assert_eq!(stats.incidents_created, 1);
        assert_eq!(stats.alerts_deduplicated, 1);
    }

    #[tokio::test]
    async fn test_distinct_fingerprints_create_incidents() {
        let orchestrator = Orchestrator::new(test_deps(), AppConfig::default());
        let a = orchestrator.ingest_alert(alert("fp-a")).await;
        let b = orchestrator.ingest_alert(alert("fp-b")).await;
        assert_ne!(a.incident_id(), b.incident_id());
    }

    #[tokio::test]
    async fn test_resolved_incident_frees_fingerprint() {
        let orchestrator = Orchestrator::new(test_deps(), AppConfig::default());
        let first = orchestrator.ingest_alert(alert("fp-1")).await;
        orchestrator
            .resolve_external(first.incident_id(), "oncall", Some("fixed"))
            .await
            .unwrap();

        let second = orchestrator.ingest_alert(alert("fp-1")).await;
        assert!(matches!(second, IngestOutcome::Created(_)));
        assert_ne!(second.incident_id(), first.incident_id());
    }

    #[tokio::test]
    async fn test_run_unknown_incident_fails() {
        let orchestrator = Orchestrator::new(test_deps(), AppConfig::default());
        let result = orchestrator.run_incident(Uuid::new_v4()).await;
        assert!(matches!(
            result,
            Err(OrchestratorError::IncidentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_without_running_workflow() {
        let orchestrator = Orchestrator::new(test_deps(), AppConfig::default());
        assert!(!orchestrator.cancel_incident(Uuid::new_v4()).await);
    }
}
