//! Approval channel.
//!
//! Out-of-band human approval for gated remediations. The transport is
//! pluggable; the workflow only needs the synchronous-appearing
//! `request(summary, deadline) -> outcome` contract.

use async_trait::async_trait;
use km_core::{ActionType, RiskLevel};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// What the approver decided, or that nobody did in time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Approved { approver: String },
    Denied { approver: String, reason: String },
    TimedOut,
}

/// What the approver sees about the pending action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSummary {
    pub incident_id: Uuid,
    pub incident_title: String,
    pub action_type: ActionType,
    pub target_resource: String,
    pub target_namespace: String,
    pub risk_level: RiskLevel,
    pub blast_radius_score: f64,
    pub reasons: Vec<String>,
    pub hypothesis_summary: String,
}

/// Transport-agnostic approval request contract.
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    /// Blocks until a decision arrives or the deadline passes.
    async fn request(&self, summary: &ActionSummary, deadline: Duration) -> ApprovalOutcome;
}

/// Scripted approval channel for tests.
pub struct MockApprovalChannel {
    outcome: ApprovalOutcome,
    /// Simulated human response latency.
    delay: Duration,
    requests: Mutex<Vec<ActionSummary>>,
}

impl MockApprovalChannel {
    pub fn approving(approver: &str) -> Self {
        Self {
            outcome: ApprovalOutcome::Approved {
                approver: approver.to_string(),
            },
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn denying(approver: &str, reason: &str) -> Self {
        Self {
            outcome: ApprovalOutcome::Denied {
                approver: approver.to_string(),
                reason: reason.to_string(),
            },
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A channel nobody answers; every request times out at its deadline.
    pub fn unanswered() -> Self {
        Self {
            outcome: ApprovalOutcome::TimedOut,
            delay: Duration::MAX,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Summaries this channel has been asked about.
    pub async fn requests(&self) -> Vec<ActionSummary> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl ApprovalChannel for MockApprovalChannel {
    async fn request(&self, summary: &ActionSummary, deadline: Duration) -> ApprovalOutcome {
        self.requests.lock().await.push(summary.clone());
        if self.delay >= deadline {
            // Simulate the deadline passing without sleeping it out.
            tokio::time::sleep(deadline.min(Duration::from_millis(10))).await;
            return ApprovalOutcome::TimedOut;
        }
        tokio::time::sleep(self.delay).await;
        self.outcome.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> ActionSummary {
        ActionSummary {
            incident_id: Uuid::new_v4(),
            incident_title: "Pod CrashLoopBackOff: api".to_string(),
            action_type: ActionType::RollbackDeployment,
            target_resource: "api".to_string(),
            target_namespace: "payments".to_string(),
            risk_level: RiskLevel::Medium,
            blast_radius_score: 42.0,
            reasons: vec!["prod_environment".to_string()],
            hypothesis_summary: "Recent deployment caused application crash".to_string(),
        }
    }

    #[tokio::test]
    async fn test_approving_channel() {
        let channel = MockApprovalChannel::approving("oncall@example.com");
        let outcome = channel.request(&summary(), Duration::from_secs(60)).await;
        assert_eq!(
            outcome,
            ApprovalOutcome::Approved {
                approver: "oncall@example.com".to_string()
            }
        );
        assert_eq!(channel.requests().await.len(), 1);
    }

    #[tokio::test]
    async fn test_denying_channel() {
        let channel = MockApprovalChannel::denying("lead@example.com", "too risky mid-incident");
        let outcome = channel.request(&summary(), Duration::from_secs(60)).await;
        match outcome {
            ApprovalOutcome::Denied { approver, reason } => {
                assert_eq!(approver, "lead@example.com");
                assert!(reason.contains("risky"));
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unanswered_channel_times_out() {
        let channel = MockApprovalChannel::unanswered();
        let outcome = channel.request(&summary(), Duration::from_millis(20)).await;
        assert_eq!(outcome, ApprovalOutcome::TimedOut);
    }
}
