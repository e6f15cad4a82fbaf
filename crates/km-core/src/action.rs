//! Remediation action models.
//!
//! Actions go through a lifecycle: proposed -> (policy_denied |
//! awaiting_approval -> approved) -> executing -> (succeeded | failed) ->
//! (verified | unverified). Re-issuing an action with the same idempotency
//! key returns the prior record without re-executing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Types of remediation actions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    RestartPod,
    DeletePod,
    RestartDeployment,
    RollbackDeployment,
    ScaleReplicas,
    CordonNode,
    DrainNode,
    UncordonNode,
    UpdateConfigmap,
    UpdateResourceLimits,
    DeletePvc,
    DeleteNamespace,
}

impl ActionType {
    /// Inherent risk classification of an action type.
    pub fn default_risk(&self) -> RiskLevel {
        match self {
            ActionType::RestartPod
            | ActionType::DeletePod
            | ActionType::RestartDeployment
            | ActionType::ScaleReplicas => RiskLevel::Low,
            ActionType::RollbackDeployment
            | ActionType::CordonNode
            | ActionType::UncordonNode => RiskLevel::Medium,
            ActionType::DrainNode
            | ActionType::UpdateConfigmap
            | ActionType::UpdateResourceLimits
            | ActionType::DeletePvc
            | ActionType::DeleteNamespace => RiskLevel::High,
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionType::RestartPod => "restart_pod",
            ActionType::DeletePod => "delete_pod",
            ActionType::RestartDeployment => "restart_deployment",
            ActionType::RollbackDeployment => "rollback_deployment",
            ActionType::ScaleReplicas => "scale_replicas",
            ActionType::CordonNode => "cordon_node",
            ActionType::DrainNode => "drain_node",
            ActionType::UncordonNode => "uncordon_node",
            ActionType::UpdateConfigmap => "update_configmap",
            ActionType::UpdateResourceLimits => "update_resource_limits",
            ActionType::DeletePvc => "delete_pvc",
            ActionType::DeleteNamespace => "delete_namespace",
        };
        write!(f, "{}", s)
    }
}

/// Risk levels for remediation actions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Weight used by the blast radius formula.
    pub fn weight(&self) -> f64 {
        match self {
            RiskLevel::Low => 0.2,
            RiskLevel::Medium => 0.5,
            RiskLevel::High => 1.0,
        }
    }
}

/// Status states for remediation actions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Proposed,
    PolicyDenied,
    AwaitingApproval,
    Approved,
    Executing,
    Succeeded,
    Failed,
    Verified,
    Unverified,
}

impl ActionStatus {
    /// Terminal statuses release the target lease and close the action.
    ///
    /// `Succeeded` is not terminal: the action still awaits verification.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::PolicyDenied
                | ActionStatus::Failed
                | ActionStatus::Verified
                | ActionStatus::Unverified
        )
    }
}

/// Structured parameters, keyed by action type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionParams {
    RestartPod {
        /// Specific pod; the executor picks an unhealthy one when absent.
        pod_name: Option<String>,
    },
    DeletePod {
        pod_name: String,
    },
    RestartDeployment {
        deployment: String,
    },
    RollbackDeployment {
        deployment: String,
        /// Specific revision; previous revision when absent.
        revision: Option<i64>,
    },
    ScaleReplicas {
        deployment: String,
        replicas: u32,
    },
    CordonNode {
        node_name: String,
    },
    UpdateResourceLimits {
        deployment: String,
        memory_limit: Option<String>,
        cpu_limit: Option<String>,
    },
    None,
}

impl ActionParams {
    /// Stable hash over the canonical JSON encoding.
    pub fn content_hash(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Builds the idempotency key for an action.
///
/// Key = `(incident_id, action_type, target, parameters_hash)`; replaying a
/// proposal with the same key must return the prior record.
pub fn idempotency_key(
    incident_id: Uuid,
    action_type: ActionType,
    target: &str,
    params: &ActionParams,
) -> String {
    let hash = params.content_hash();
    format!(
        "{}:{}:{}:{}",
        incident_id,
        action_type,
        target,
        &hash[..16]
    )
}

/// A remediation action proposed or executed for an incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationAction {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub hypothesis_id: Option<Uuid>,
    /// Globally unique; replays of the same key return the prior record.
    pub idempotency_key: String,
    pub action_type: ActionType,
    pub target_resource: String,
    pub target_namespace: String,
    pub parameters: ActionParams,
    pub risk_level: RiskLevel,
    /// Blast radius in [0, 100].
    pub blast_radius_score: f64,
    pub status: ActionStatus,
    pub status_reason: Option<String>,
    pub requires_approval: bool,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_result: Option<ExecutionResult>,
    pub created_at: DateTime<Utc>,
}

impl RemediationAction {
    /// Proposes a new action, deriving risk level and idempotency key.
    pub fn propose(
        incident_id: Uuid,
        hypothesis_id: Option<Uuid>,
        action_type: ActionType,
        target_resource: &str,
        target_namespace: &str,
        parameters: ActionParams,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            incident_id,
            hypothesis_id,
            idempotency_key: idempotency_key(incident_id, action_type, target_resource, &parameters),
            action_type,
            target_resource: target_resource.to_string(),
            target_namespace: target_namespace.to_string(),
            parameters,
            risk_level: action_type.default_risk(),
            blast_radius_score: 0.0,
            status: ActionStatus::Proposed,
            status_reason: None,
            requires_approval: false,
            approved_by: None,
            approved_at: None,
            executed_at: None,
            completed_at: None,
            execution_result: None,
            created_at: Utc::now(),
        }
    }

    pub fn set_status(&mut self, status: ActionStatus, reason: Option<String>) {
        self.status = status;
        self.status_reason = reason;
        if status.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
    }
}

/// Result of one action execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub success: bool,
    pub message: String,
    /// Action-specific output (pod deleted, revision rolled back to, ...).
    pub details: serde_json::Value,
    /// How many attempts the executor made.
    pub attempts: u32,
    pub duration_ms: u64,
}

/// Result of verifying an action's effect on the incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub id: Uuid,
    pub action_id: Uuid,
    pub incident_id: Uuid,
    pub success: bool,
    pub metrics_improved: bool,
    pub error_rate_before: Option<f64>,
    pub error_rate_after: Option<f64>,
    pub latency_before: Option<f64>,
    pub latency_after: Option<f64>,
    /// Restart count delta observed after the verification delay.
    pub restart_count_delta_post: f64,
    /// Fraction of pods ready at verification time.
    pub pods_ready_ratio: f64,
    pub verification_details: serde_json::Value,
    pub verified_at: DateTime<Utc>,
}
