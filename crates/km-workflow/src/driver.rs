//! The durable incident workflow.
//!
//! An explicit event-sourced state machine: every transition and every
//! non-pure activity result is journaled before downstream steps observe
//! it, so a crash-restarted driver replays the journal and resumes at the
//! next suspension point without re-executing completed activities.
//! Suspension points (collection join, approval wait, verification delay,
//! retry backoff) all observe the cancellation signal.

use crate::journal::{JournalEntry, JournalError, WorkflowJournal};
use chrono::{DateTime, Utc};
use km_actions::{ActionRegistry, ActionRequest, VerificationBaseline, Verifier};
use km_collectors::{CollectorRegistry, IncidentContext};
use km_connectors::MetricSelector;
use km_core::{
    apply_enrichment, ActionParams, ActionStatus, ActionType, AppConfig, AuditAction,
    CollectorOutput, Enricher, EntityKey, EntityKind, Evidence, EvidenceData, ExecutionResult,
    FailureReason, GraphError, GraphStore, Hypothesis, Incident, IncidentStatus, RelationType,
    RemediationAction, RulesEngine, TimeWindow, VerificationResult,
};
use km_observability::{AuditKind, AuditLog, AuditRecord};
use km_policy::{
    compute_blast_radius, ActionSummary, ApprovalChannel, ApprovalOutcome, BlastRadiusInput,
    BlastWeights, PolicyConfig, PolicyDecision, PolicyEvaluation, PolicyInput,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors that end a workflow run abnormally.
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: IncidentStatus,
        to: IncidentStatus,
    },

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Workflow cancelled")]
    Cancelled,
}

/// Time source for the policy gate inputs; swapped for a fixed clock in
/// tests so freeze-window behavior is deterministic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Retry policy for workflow activities (graph upserts and the like).
#[derive(Debug, Clone)]
pub struct ActivityRetry {
    pub max_attempts: u32,
    pub backoff: Vec<Duration>,
}

impl Default for ActivityRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(4),
                Duration::from_secs(16),
            ],
        }
    }
}

impl ActivityRetry {
    pub fn fast() -> Self {
        Self {
            max_attempts: 3,
            backoff: vec![Duration::ZERO; 3],
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self
            .backoff
            .get(attempt as usize)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::from_secs(1));
        // Up to 25% jitter so concurrent workflows spread their retries.
        let jitter = 1.0 + jitter_fraction() * 0.25;
        base.mul_f64(jitter)
    }
}

fn jitter_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

/// Everything the driver composes.
#[derive(Clone)]
pub struct WorkflowDeps {
    pub graph: Arc<dyn GraphStore>,
    pub collectors: Arc<CollectorRegistry>,
    pub rules: Arc<RulesEngine>,
    pub enricher: Option<Arc<dyn Enricher>>,
    pub approvals: Arc<dyn ApprovalChannel>,
    pub actions: Arc<ActionRegistry>,
    pub verifier: Arc<Verifier>,
    pub journal: Arc<dyn WorkflowJournal>,
    pub audit: Arc<AuditLog>,
    pub clock: Arc<dyn Clock>,
}

/// What the workflow produced.
#[derive(Debug)]
pub struct WorkflowOutcome {
    pub final_status: IncidentStatus,
    pub failure_reason: Option<FailureReason>,
    pub hypotheses: Vec<Hypothesis>,
    pub action: Option<RemediationAction>,
    pub verification: Option<VerificationResult>,
}

/// Facts about the incident derived from collected evidence, used when
/// turning a recommended action into a concrete proposal.
#[derive(Debug, Clone, Default)]
struct ProposalContext {
    deployment: Option<String>,
    failing_pod: Option<String>,
    node_name: Option<String>,
    pod_count: usize,
    failures_on_node: u32,
}

impl ProposalContext {
    fn from_evidence(incident: &Incident, evidence: &[Evidence]) -> Self {
        let mut ctx = Self {
            deployment: incident.service.clone(),
            ..Self::default()
        };
        for ev in evidence {
            match &ev.data {
                EvidenceData::PodState {
                    name,
                    node_name,
                    ready,
                    waiting_reason,
                    terminated_reason,
                    phase,
                    ..
                } => {
                    ctx.pod_count += 1;
                    let failing = !ready
                        || phase != "Running"
                        || waiting_reason.is_some()
                        || terminated_reason.is_some();
                    if failing && ctx.failing_pod.is_none() {
                        ctx.failing_pod = Some(name.clone());
                        if ctx.node_name.is_none() {
                            ctx.node_name = node_name.clone();
                        }
                    }
                }
                EvidenceData::DeployHistory { deployment, .. } => {
                    if ctx.deployment.is_none() {
                        ctx.deployment = Some(deployment.clone());
                    }
                }
                EvidenceData::NodeState {
                    name, pod_failures, ..
                } => {
                    ctx.node_name = Some(name.clone());
                    ctx.failures_on_node = ctx.failures_on_node.max(*pod_failures);
                }
                _ => {}
            }
        }
        ctx
    }
}

/// Counts journaled transitions so a replayed run does not duplicate them.
struct ReplayLedger {
    status_counts: HashMap<(IncidentStatus, IncidentStatus), usize>,
    failure_counts: HashMap<FailureReason, usize>,
}

impl ReplayLedger {
    fn from_entries(entries: &[JournalEntry]) -> Self {
        let mut status_counts: HashMap<(IncidentStatus, IncidentStatus), usize> = HashMap::new();
        let mut failure_counts: HashMap<FailureReason, usize> = HashMap::new();
        for entry in entries {
            match entry {
                JournalEntry::StatusChanged { from, to, .. } => {
                    *status_counts.entry((*from, *to)).or_insert(0) += 1;
                }
                JournalEntry::WorkflowFailed { reason, .. } => {
                    *failure_counts.entry(reason.clone()).or_insert(0) += 1;
                }
                JournalEntry::ActivityCompleted { .. } => {}
            }
        }
        Self {
            status_counts,
            failure_counts,
        }
    }

    /// True when this transition was already journaled by a prior run.
    fn consume_status(&mut self, from: IncidentStatus, to: IncidentStatus) -> bool {
        match self.status_counts.get_mut(&(from, to)) {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        }
    }

    fn consume_failure(&mut self, reason: &FailureReason) -> bool {
        match self.failure_counts.get_mut(reason) {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        }
    }
}

/// Summary of the graph-build activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GraphBuildSummary {
    entities: usize,
    relations: usize,
    evidence: usize,
}

/// The durable incident workflow driver.
pub struct IncidentWorkflow {
    deps: WorkflowDeps,
    config: AppConfig,
    policy: PolicyConfig,
    blast_weights: BlastWeights,
    retry: ActivityRetry,
    cancel: watch::Receiver<bool>,
}

impl IncidentWorkflow {
    pub fn new(deps: WorkflowDeps, config: AppConfig, cancel: watch::Receiver<bool>) -> Self {
        let policy = PolicyConfig::from_app(&config);
        Self {
            deps,
            config,
            policy,
            blast_weights: BlastWeights::default(),
            retry: ActivityRetry::default(),
            cancel,
        }
    }

    /// Overrides the activity retry policy (tests use `ActivityRetry::fast`).
    pub fn with_activity_retry(mut self, retry: ActivityRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Runs the workflow to a terminal state.
    ///
    /// Cancellation is handled here: the incident is failed with
    /// `Cancelled` and no further cluster mutations are issued.
    #[instrument(skip(self, incident), fields(incident_id = %incident.id, fingerprint = %incident.fingerprint))]
    pub async fn run(&self, incident: &mut Incident) -> Result<WorkflowOutcome, WorkflowError> {
        match self.drive(incident).await {
            Ok(outcome) => Ok(outcome),
            Err(WorkflowError::Cancelled) => {
                warn!("workflow observed cancellation");
                if incident.fail(FailureReason::Cancelled, "workflow") {
                    self.deps
                        .journal
                        .append(incident.id, JournalEntry::failed(FailureReason::Cancelled))
                        .await?;
                }
                Ok(WorkflowOutcome {
                    final_status: incident.status,
                    failure_reason: incident.failure_reason.clone(),
                    hypotheses: Vec::new(),
                    action: None,
                    verification: None,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn drive(&self, incident: &mut Incident) -> Result<WorkflowOutcome, WorkflowError> {
        let incident_id = incident.id;
        let journal_so_far = self.deps.journal.load(incident_id).await?;
        let mut ledger = ReplayLedger::from_entries(&journal_so_far);
        if !journal_so_far.is_empty() {
            info!(entries = journal_so_far.len(), "resuming from journal");
        }

        self.deps
            .graph
            .register_incident(
                incident_id,
                &incident.cluster,
                &incident.namespace,
                HashMap::from([
                    ("title".to_string(), serde_json::json!(incident.title)),
                    (
                        "severity".to_string(),
                        serde_json::json!(incident.severity.to_string()),
                    ),
                ]),
            )
            .await?;

        self.transition(&mut ledger, incident, IncidentStatus::Investigating)
            .await?;

        // Parallel evidence collection, joined on a barrier.
        let ctx = IncidentContext::from_incident(incident, self.config.deploy_lookback_minutes);
        let window = TimeWindow::around(
            incident.started_at,
            self.config.collection.evidence_window_minutes,
        );
        let per_source = Duration::from_secs(self.config.collection.deadline_per_source_secs);
        let total = Duration::from_secs(self.config.collection.deadline_total_secs);
        let outputs: Vec<CollectorOutput> = self
            .run_activity(incident_id, "collect", async {
                Ok(self
                    .deps
                    .collectors
                    .collect_all(&ctx, window, per_source, total)
                    .await)
            })
            .await?;
        let evidence: Vec<Evidence> = outputs.iter().flat_map(|o| o.evidence.clone()).collect();
        incident.record(
            AuditAction::EvidenceAttached {
                count: evidence.len(),
            },
            "workflow",
        );

        let summary: GraphBuildSummary = self
            .run_activity(
                incident_id,
                "graph",
                self.build_graph_with_retries(incident_id, &incident.cluster, incident.service.as_deref(), &outputs),
            )
            .await?;
        debug!(
            entities = summary.entities,
            evidence = summary.evidence,
            "evidence graph built"
        );

        let hypotheses: Vec<Hypothesis> = self
            .run_activity(incident_id, "hypotheses", async {
                let mut generated = self.deps.rules.generate(incident_id, &evidence);
                if let Some(enricher) = &self.deps.enricher {
                    let mut enriched = Vec::with_capacity(generated.len());
                    for hypothesis in generated {
                        enriched.push(apply_enrichment(enricher.as_ref(), hypothesis).await);
                    }
                    generated = enriched;
                }
                Ok(generated)
            })
            .await?;
        incident.record(
            AuditAction::HypothesesRanked {
                count: hypotheses.len(),
            },
            "workflow",
        );

        self.remediate(&mut ledger, incident, &hypotheses, &evidence)
            .await
    }

    /// Walks ranked hypotheses and their recommended actions through the
    /// gate, approval, execution, and verification, within the retry budget.
    async fn remediate(
        &self,
        ledger: &mut ReplayLedger,
        incident: &mut Incident,
        hypotheses: &[Hypothesis],
        evidence: &[Evidence],
    ) -> Result<WorkflowOutcome, WorkflowError> {
        let incident_id = incident.id;
        let context = ProposalContext::from_evidence(incident, evidence);

        let mut candidates: Vec<(Hypothesis, ActionType)> = Vec::new();
        for hypothesis in hypotheses {
            for action_type in &hypothesis.recommended_actions {
                candidates.push((hypothesis.clone(), *action_type));
            }
        }

        let mut attempts: u32 = 0;
        let mut denied = false;
        let mut last_failure: Option<FailureReason> = None;
        let mut action_record: Option<RemediationAction> = None;
        let mut verification: Option<VerificationResult> = None;

        for (idx, (hypothesis, action_type)) in candidates.iter().enumerate() {
            if attempts >= self.config.retry_budget {
                break;
            }
            self.transition(ledger, incident, IncidentStatus::Remediating)
                .await?;

            let Some(proposed) = self.propose(incident, hypothesis, *action_type, &context) else {
                debug!(action = %action_type, "no usable target for recommended action");
                continue;
            };
            let mut action: RemediationAction = self
                .run_activity(incident_id, &format!("propose:{}", idx), async {
                    Ok(proposed)
                })
                .await?;
            incident.record(
                AuditAction::ActionProposed {
                    action_id: action.id,
                },
                "workflow",
            );

            // Pure gate; journaled so replay sees the identical decision.
            let affected = affected_replicas(*action_type, &context);
            let evaluation: PolicyEvaluation = self
                .run_activity(incident_id, &format!("policy:{}", idx), async {
                    let input = PolicyInput {
                        environment: self.config.environment,
                        action_type: *action_type,
                        namespace: incident.namespace.clone(),
                        blast_radius_score: action.blast_radius_score,
                        affected_replicas: affected,
                        current_hour: 0,
                        is_weekend: false,
                        freeze_active: self.config.freeze.active,
                    }
                    .at_time(self.deps.clock.now());
                    Ok(km_policy::evaluate(&input, &self.policy))
                })
                .await?;
            self.deps
                .audit
                .log(AuditRecord::new(
                    incident_id,
                    AuditKind::PolicyEvaluated,
                    decision_tag(&evaluation.decision),
                    serde_json::to_value(&evaluation)?,
                ))
                .await;

            match evaluation.decision.clone() {
                PolicyDecision::Deny { reasons } => {
                    let reason = reasons.join("; ");
                    action.set_status(ActionStatus::PolicyDenied, Some(reason.clone()));
                    incident.record(
                        AuditAction::ActionDenied {
                            action_id: action.id,
                            reason,
                        },
                        "policy-gate",
                    );
                    denied = true;
                    action_record = Some(action);
                    continue;
                }
                PolicyDecision::RequireApproval { reasons } => {
                    action.requires_approval = true;
                    action.set_status(ActionStatus::AwaitingApproval, Some(reasons.join("; ")));
                    self.transition(ledger, incident, IncidentStatus::AwaitingApproval)
                        .await?;
                    match self
                        .wait_for_approval(incident, hypothesis, &action, reasons, idx)
                        .await?
                    {
                        ApprovalOutcome::Approved { approver } => {
                            action.approved_by = Some(approver.clone());
                            action.approved_at = Some(Utc::now());
                            action.set_status(ActionStatus::Approved, None);
                            incident.record(
                                AuditAction::ActionApproved {
                                    action_id: action.id,
                                    approver,
                                },
                                "approval-channel",
                            );
                            self.transition(ledger, incident, IncidentStatus::Remediating)
                                .await?;
                        }
                        ApprovalOutcome::Denied { approver, reason } => {
                            let note = format!("denied by {}: {}", approver, reason);
                            action.set_status(ActionStatus::PolicyDenied, Some(note.clone()));
                            incident.record(
                                AuditAction::ActionDenied {
                                    action_id: action.id,
                                    reason: note,
                                },
                                &approver,
                            );
                            denied = true;
                            action_record = Some(action);
                            continue;
                        }
                        ApprovalOutcome::TimedOut => {
                            action.set_status(
                                ActionStatus::Failed,
                                Some("approval timed out".to_string()),
                            );
                            action_record = Some(action);
                            return self
                                .finish_failed(
                                    ledger,
                                    incident,
                                    FailureReason::ApprovalTimeout,
                                    hypotheses.to_vec(),
                                    action_record,
                                    verification,
                                )
                                .await;
                        }
                    }
                }
                PolicyDecision::Allow => {}
            }

            // Baseline before mutating anything.
            let selector = MetricSelector {
                namespace: incident.namespace.clone(),
                service: incident.service.clone(),
            };
            let baseline: VerificationBaseline = self
                .run_activity(incident_id, &format!("baseline:{}", idx), async {
                    Ok(self.deps.verifier.capture_baseline(&selector).await)
                })
                .await?;

            action.set_status(ActionStatus::Executing, None);
            action.executed_at = Some(Utc::now());
            let request = ActionRequest {
                action: action.clone(),
                service: incident.service.clone(),
            };
            let execution: ExecutionResult = self
                .run_activity(incident_id, &format!("execute:{}", idx), async {
                    match self.deps.actions.execute(&request).await {
                        Ok(result) => Ok(result),
                        // Pre-flight failures become failed results so the
                        // journal and the hypothesis loop see one shape.
                        Err(e) => Ok(ExecutionResult {
                            success: false,
                            message: e.to_string(),
                            details: serde_json::json!({ "error_kind": e.kind() }),
                            attempts: 0,
                            duration_ms: 0,
                        }),
                    }
                })
                .await?;
            self.deps
                .audit
                .log(AuditRecord::new(
                    incident_id,
                    AuditKind::ActionExecuted,
                    if execution.success { "success" } else { "failure" },
                    serde_json::to_value(&execution)?,
                ))
                .await;
            action.execution_result = Some(execution.clone());

            if !execution.success {
                action.set_status(ActionStatus::Failed, Some(execution.message.clone()));
                incident.record(
                    AuditAction::ActionFailed {
                        action_id: action.id,
                        reason: execution.message.clone(),
                    },
                    "executor",
                );
                attempts += 1;
                last_failure = Some(FailureReason::ExecutionFailed);
                action_record = Some(action);
                continue;
            }
            action.set_status(ActionStatus::Succeeded, None);
            incident.record(
                AuditAction::ActionExecuted {
                    action_id: action.id,
                },
                "executor",
            );

            // Verification delay; journaled so a replay does not re-sleep.
            self.transition(ledger, incident, IncidentStatus::Verifying)
                .await?;
            let () = self
                .run_activity(incident_id, &format!("verify_delay:{}", idx), async {
                    self.suspend(Duration::from_secs(self.config.verification.delay_secs))
                        .await?;
                    Ok(())
                })
                .await?;

            let result: VerificationResult = self
                .run_activity(incident_id, &format!("verify:{}", idx), async {
                    Ok(self
                        .deps
                        .verifier
                        .verify(
                            incident_id,
                            action.id,
                            &incident.namespace,
                            incident.service.as_deref(),
                            &baseline,
                        )
                        .await)
                })
                .await?;
            self.deps
                .audit
                .log(AuditRecord::new(
                    incident_id,
                    AuditKind::VerificationCompleted,
                    if result.success { "success" } else { "failure" },
                    serde_json::to_value(&result)?,
                ))
                .await;
            incident.record(
                AuditAction::VerificationRecorded {
                    action_id: action.id,
                    success: result.success,
                },
                "verifier",
            );
            verification = Some(result.clone());

            if result.success {
                action.set_status(ActionStatus::Verified, None);
                action_record = Some(action);
                self.transition(ledger, incident, IncidentStatus::Resolved)
                    .await?;
                info!("incident resolved");
                return Ok(WorkflowOutcome {
                    final_status: incident.status,
                    failure_reason: None,
                    hypotheses: hypotheses.to_vec(),
                    action: action_record,
                    verification,
                });
            }

            action.set_status(
                ActionStatus::Unverified,
                Some("metrics did not recover".to_string()),
            );
            action_record = Some(action);
            attempts += 1;
            last_failure = Some(FailureReason::VerificationFailed);
        }

        let reason = match (last_failure, denied) {
            (Some(failure), _) => failure,
            (None, true) => FailureReason::PolicyDenied,
            (None, false) => {
                incident.record(
                    AuditAction::NoteAdded("no remediable action available".to_string()),
                    "workflow",
                );
                FailureReason::ExecutionFailed
            }
        };
        self.finish_failed(
            ledger,
            incident,
            reason,
            hypotheses.to_vec(),
            action_record,
            verification,
        )
        .await
    }

    async fn finish_failed(
        &self,
        ledger: &mut ReplayLedger,
        incident: &mut Incident,
        reason: FailureReason,
        hypotheses: Vec<Hypothesis>,
        action: Option<RemediationAction>,
        verification: Option<VerificationResult>,
    ) -> Result<WorkflowOutcome, WorkflowError> {
        warn!(reason = %reason, "workflow failed");
        if incident.fail(reason.clone(), "workflow") && !ledger.consume_failure(&reason) {
            self.deps
                .journal
                .append(incident.id, JournalEntry::failed(reason))
                .await?;
        }
        Ok(WorkflowOutcome {
            final_status: incident.status,
            failure_reason: incident.failure_reason.clone(),
            hypotheses,
            action,
            verification,
        })
    }

    async fn wait_for_approval(
        &self,
        incident: &Incident,
        hypothesis: &Hypothesis,
        action: &RemediationAction,
        reasons: Vec<String>,
        idx: usize,
    ) -> Result<ApprovalOutcome, WorkflowError> {
        let summary = ActionSummary {
            incident_id: incident.id,
            incident_title: incident.title.clone(),
            action_type: action.action_type,
            target_resource: action.target_resource.clone(),
            target_namespace: action.target_namespace.clone(),
            risk_level: action.risk_level,
            blast_radius_score: action.blast_radius_score,
            reasons: reasons.clone(),
            hypothesis_summary: hypothesis.title.clone(),
        };
        self.deps
            .audit
            .log(AuditRecord::new(
                incident.id,
                AuditKind::ApprovalRequested,
                "pending",
                serde_json::to_value(&summary)?,
            ))
            .await;

        let deadline = Duration::from_secs(self.config.approval_timeout_secs);
        let outcome: ApprovalOutcome = self
            .run_activity(incident.id, &format!("approval:{}", idx), async {
                let cancel = self.cancel.clone();
                tokio::select! {
                    outcome = self.deps.approvals.request(&summary, deadline) => Ok(outcome),
                    _ = wait_cancelled(cancel) => Err(WorkflowError::Cancelled),
                }
            })
            .await?;

        self.deps
            .audit
            .log(AuditRecord::new(
                incident.id,
                AuditKind::ApprovalDecided,
                match &outcome {
                    ApprovalOutcome::Approved { .. } => "approved",
                    ApprovalOutcome::Denied { .. } => "denied",
                    ApprovalOutcome::TimedOut => "timed_out",
                },
                serde_json::to_value(&outcome)?,
            ))
            .await;
        Ok(outcome)
    }

    /// Turns a recommended action into a concrete proposal with a blast
    /// radius score. Returns `None` when no usable target is known.
    fn propose(
        &self,
        incident: &Incident,
        hypothesis: &Hypothesis,
        action_type: ActionType,
        context: &ProposalContext,
    ) -> Option<RemediationAction> {
        let (target, params) = build_target_and_params(action_type, context)?;
        let mut action = RemediationAction::propose(
            incident.id,
            Some(hypothesis.id),
            action_type,
            &target,
            &incident.namespace,
            params,
        );
        let input = BlastRadiusInput {
            action_type,
            risk_level: action.risk_level,
            affected_replicas: affected_replicas(action_type, context),
            total_replicas: context.pod_count.max(1) as u32,
            namespace: incident.namespace.clone(),
            namespace_criticality: self.config.criticality_of(&incident.namespace),
            environment: self.config.environment,
        };
        let assessment = compute_blast_radius(&input, &self.blast_weights);
        action.blast_radius_score = assessment.score;
        Some(action)
    }

    async fn build_graph_with_retries(
        &self,
        incident_id: Uuid,
        cluster: &str,
        service: Option<&str>,
        outputs: &[CollectorOutput],
    ) -> Result<GraphBuildSummary, WorkflowError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .try_build_graph(incident_id, cluster, service, outputs)
                .await
            {
                Ok(summary) => return Ok(summary),
                Err(e) if attempt < self.retry.max_attempts => {
                    let backoff = self.retry.backoff_for(attempt - 1);
                    warn!(error = %e, attempt, "graph build failed, retrying");
                    self.suspend(backoff).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_build_graph(
        &self,
        incident_id: Uuid,
        cluster: &str,
        service: Option<&str>,
        outputs: &[CollectorOutput],
    ) -> Result<GraphBuildSummary, WorkflowError> {
        let graph = &self.deps.graph;
        let mut summary = GraphBuildSummary {
            entities: 0,
            relations: 0,
            evidence: 0,
        };
        for output in outputs {
            for draft in &output.entities {
                let id = graph
                    .upsert_entity(draft.key.clone(), draft.attrs.clone())
                    .await?;
                summary.entities += 1;
                if draft.key.kind == EntityKind::Pod {
                    graph
                        .link_incident_to_entity(
                            incident_id,
                            id,
                            RelationType::Affects,
                            HashMap::new(),
                        )
                        .await?;
                }
            }
            for relation in &output.relations {
                let from = graph
                    .upsert_entity(relation.from.clone(), HashMap::new())
                    .await?;
                let to = graph
                    .upsert_entity(relation.to.clone(), HashMap::new())
                    .await?;
                graph
                    .link(from, to, relation.relation, HashMap::new())
                    .await?;
                summary.relations += 1;
            }
            for evidence in &output.evidence {
                let about = about_key(evidence, cluster, service);
                graph.attach_evidence(incident_id, evidence, about).await?;
                summary.evidence += 1;
            }
        }
        Ok(summary)
    }

    async fn transition(
        &self,
        ledger: &mut ReplayLedger,
        incident: &mut Incident,
        to: IncidentStatus,
    ) -> Result<(), WorkflowError> {
        if incident.status == to {
            return Ok(());
        }
        let from = incident.status;
        if !incident.transition(to, "workflow") {
            return Err(WorkflowError::InvalidTransition { from, to });
        }
        debug!(%from, %to, "status transition");
        if !ledger.consume_status(from, to) {
            self.deps
                .journal
                .append(incident.id, JournalEntry::status(from, to))
                .await?;
        }
        Ok(())
    }

    /// Replay-aware activity wrapper: journaled results short-circuit,
    /// fresh results are journaled before being observed downstream.
    async fn run_activity<T, Fut>(
        &self,
        incident_id: Uuid,
        key: &str,
        fut: Fut,
    ) -> Result<T, WorkflowError>
    where
        T: Serialize + serde::de::DeserializeOwned,
        Fut: std::future::Future<Output = Result<T, WorkflowError>>,
    {
        if let Some(value) = self.deps.journal.find_activity(incident_id, key).await? {
            debug!(key, "activity replayed from journal");
            return Ok(serde_json::from_value(value)?);
        }
        self.check_cancel()?;
        let result = fut.await?;
        let value = serde_json::to_value(&result)?;
        self.deps
            .journal
            .append(incident_id, JournalEntry::activity(key, value))
            .await?;
        Ok(result)
    }

    fn check_cancel(&self) -> Result<(), WorkflowError> {
        if *self.cancel.borrow() {
            return Err(WorkflowError::Cancelled);
        }
        Ok(())
    }

    /// Cancellation-observing sleep.
    async fn suspend(&self, duration: Duration) -> Result<(), WorkflowError> {
        self.check_cancel()?;
        if duration.is_zero() {
            return Ok(());
        }
        let mut cancel = self.cancel.clone();
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Ok(()),
                changed = cancel.changed() => match changed {
                    Ok(()) if *cancel.borrow() => return Err(WorkflowError::Cancelled),
                    Ok(()) => continue,
                    Err(_) => {
                        (&mut sleep).await;
                        return Ok(());
                    }
                },
            }
        }
    }
}

/// Resolves once the cancel signal is raised; pends forever otherwise.
async fn wait_cancelled(mut cancel: watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn decision_tag(decision: &PolicyDecision) -> &'static str {
    match decision {
        PolicyDecision::Allow => "allow",
        PolicyDecision::RequireApproval { .. } => "require_approval",
        PolicyDecision::Deny { .. } => "deny",
    }
}

fn build_target_and_params(
    action_type: ActionType,
    context: &ProposalContext,
) -> Option<(String, ActionParams)> {
    match action_type {
        ActionType::RestartPod => {
            let target = context
                .failing_pod
                .clone()
                .or_else(|| context.deployment.clone())?;
            Some((
                target,
                ActionParams::RestartPod {
                    pod_name: context.failing_pod.clone(),
                },
            ))
        }
        ActionType::DeletePod => context.failing_pod.clone().map(|pod| {
            (
                pod.clone(),
                ActionParams::DeletePod { pod_name: pod },
            )
        }),
        ActionType::RestartDeployment => context.deployment.clone().map(|deployment| {
            (
                deployment.clone(),
                ActionParams::RestartDeployment { deployment },
            )
        }),
        ActionType::RollbackDeployment => context.deployment.clone().map(|deployment| {
            (
                deployment.clone(),
                ActionParams::RollbackDeployment {
                    deployment,
                    revision: None,
                },
            )
        }),
        ActionType::ScaleReplicas => context.deployment.clone().map(|deployment| {
            (
                deployment.clone(),
                ActionParams::ScaleReplicas {
                    deployment,
                    replicas: context.pod_count as u32 + 1,
                },
            )
        }),
        ActionType::CordonNode => context.node_name.clone().map(|node| {
            (
                node.clone(),
                ActionParams::CordonNode { node_name: node },
            )
        }),
        ActionType::UpdateResourceLimits => context.deployment.clone().map(|deployment| {
            (
                deployment.clone(),
                ActionParams::UpdateResourceLimits {
                    deployment,
                    memory_limit: None,
                    cpu_limit: None,
                },
            )
        }),
        _ => None,
    }
}

fn affected_replicas(action_type: ActionType, context: &ProposalContext) -> u32 {
    match action_type {
        ActionType::RestartPod | ActionType::DeletePod => 1,
        ActionType::CordonNode => context.failures_on_node.max(1),
        _ => context.pod_count.max(1) as u32,
    }
}

fn about_key(evidence: &Evidence, cluster: &str, service: Option<&str>) -> Option<EntityKey> {
    match &evidence.data {
        EvidenceData::PodState { name, .. } => Some(EntityKey::new(
            cluster,
            &evidence.entity_namespace,
            EntityKind::Pod,
            name,
        )),
        EvidenceData::ContainerState { pod, .. } => Some(EntityKey::new(
            cluster,
            &evidence.entity_namespace,
            EntityKind::Pod,
            pod,
        )),
        EvidenceData::DeployHistory { deployment, .. } => Some(EntityKey::new(
            cluster,
            &evidence.entity_namespace,
            EntityKind::Deployment,
            deployment,
        )),
        EvidenceData::NodeState { name, .. } => {
            Some(EntityKey::cluster_scoped(cluster, EntityKind::Node, name))
        }
        EvidenceData::HpaState { name, .. } => Some(EntityKey::new(
            cluster,
            &evidence.entity_namespace,
            EntityKind::Hpa,
            name,
        )),
        EvidenceData::LogsPattern { .. } => service.map(|s| {
            EntityKey::new(
                cluster,
                &evidence.entity_namespace,
                EntityKind::Deployment,
                s,
            )
        }),
        EvidenceData::MetricSample { .. } | EvidenceData::Events { .. } => None,
    }
}
