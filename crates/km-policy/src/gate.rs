//! The remediation policy gate.
//!
//! A pure function from `(action, context)` to ALLOW, REQUIRE_APPROVAL, or
//! DENY. It takes the clock as an input (`current_hour`, `is_weekend`), does
//! no I/O, and is never retried. The evaluation record carries the inputs,
//! the decision, and the matched rule keys for audit.

use chrono::{DateTime, Utc};
use km_core::{ActionType, AppConfig, Environment};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;
use uuid::Uuid;

/// Inputs to one policy evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyInput {
    pub environment: Environment,
    pub action_type: ActionType,
    pub namespace: String,
    pub blast_radius_score: f64,
    pub affected_replicas: u32,
    /// Local hour, 0-23.
    pub current_hour: u32,
    pub is_weekend: bool,
    pub freeze_active: bool,
}

impl PolicyInput {
    /// Fills the clock fields from a timestamp.
    pub fn at_time(mut self, at: DateTime<Utc>) -> Self {
        use chrono::{Datelike, Timelike, Weekday};
        self.current_hour = at.hour();
        self.is_weekend = matches!(at.weekday(), Weekday::Sat | Weekday::Sun);
        self
    }
}

/// The gate's verdict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PolicyDecision {
    Allow,
    RequireApproval { reasons: Vec<String> },
    Deny { reasons: Vec<String> },
}

impl PolicyDecision {
    pub fn is_allow(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }

    pub fn is_deny(&self) -> bool {
        matches!(self, PolicyDecision::Deny { .. })
    }

    pub fn requires_approval(&self) -> bool {
        matches!(self, PolicyDecision::RequireApproval { .. })
    }
}

/// Policy gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub protected_namespaces: BTreeSet<String>,
    pub high_risk_actions: BTreeSet<ActionType>,
    pub allowlists: BTreeMap<Environment, BTreeSet<ActionType>>,
    /// Blast radius at or above this denies in staging.
    pub staging_blast_threshold: f64,
    /// Blast radius at or above this denies in prod.
    pub prod_blast_threshold: f64,
    /// Blast radius at or above this needs approval in staging.
    pub staging_approval_blast_threshold: f64,
    /// Affected replicas at or above this deny outside dev.
    pub replica_deny_threshold: u32,
    /// Affected replicas at or above this need approval.
    pub replica_approval_threshold: u32,
    /// Action classes that always need approval.
    pub approval_required_actions: BTreeSet<ActionType>,
    /// Nightly freeze start hour (inclusive).
    pub freeze_hours_start: u32,
    /// Nightly freeze end hour (exclusive).
    pub freeze_hours_end: u32,
}

impl PolicyConfig {
    /// Builds the gate config from application configuration.
    pub fn from_app(app: &AppConfig) -> Self {
        Self {
            protected_namespaces: app.protected_namespaces.clone(),
            high_risk_actions: app.high_risk_actions.clone(),
            allowlists: app.allowlists.clone(),
            freeze_hours_start: app.freeze.hours_start,
            freeze_hours_end: app.freeze.hours_end,
            ..Default::default()
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let app = AppConfig::default();
        Self {
            protected_namespaces: app.protected_namespaces,
            high_risk_actions: app.high_risk_actions,
            allowlists: app.allowlists,
            staging_blast_threshold: 75.0,
            prod_blast_threshold: 50.0,
            staging_approval_blast_threshold: 30.0,
            replica_deny_threshold: 5,
            replica_approval_threshold: 3,
            approval_required_actions: [ActionType::RollbackDeployment, ActionType::CordonNode]
                .into_iter()
                .collect(),
            freeze_hours_start: app.freeze.hours_start,
            freeze_hours_end: app.freeze.hours_end,
        }
    }
}

/// The persisted record of one evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEvaluation {
    pub id: Uuid,
    pub input: PolicyInput,
    pub decision: PolicyDecision,
    pub matched_rules: Vec<String>,
    pub evaluated_at: DateTime<Utc>,
}

/// Evaluates the policy gate. Deterministic and side-effect free.
pub fn evaluate(input: &PolicyInput, config: &PolicyConfig) -> PolicyEvaluation {
    let mut matched = Vec::new();
    let mut deny_reasons = Vec::new();
    let in_dev = input.environment == Environment::Dev;

    if !in_dev && config.high_risk_actions.contains(&input.action_type) {
        matched.push("high_risk_action".to_string());
        deny_reasons.push(format!(
            "action {} is high-risk outside dev",
            input.action_type
        ));
    }
    if !in_dev && config.protected_namespaces.contains(&input.namespace) {
        matched.push("protected_namespace".to_string());
        deny_reasons.push(format!("namespace {} is protected", input.namespace));
    }
    let blast_threshold = match input.environment {
        Environment::Dev => None,
        Environment::Staging => Some(config.staging_blast_threshold),
        Environment::Prod => Some(config.prod_blast_threshold),
    };
    if let Some(threshold) = blast_threshold {
        if input.blast_radius_score >= threshold {
            matched.push("blast_radius_exceeded".to_string());
            deny_reasons.push(format!(
                "blast radius {:.1} at or above {} threshold {:.0}",
                input.blast_radius_score, input.environment, threshold
            ));
        }
    }
    if !in_dev && input.affected_replicas >= config.replica_deny_threshold {
        matched.push("replica_limit".to_string());
        deny_reasons.push(format!(
            "{} affected replicas at or above limit {}",
            input.affected_replicas, config.replica_deny_threshold
        ));
    }
    let allowlisted = config
        .allowlists
        .get(&input.environment)
        .map(|set| set.contains(&input.action_type))
        .unwrap_or(false);
    if !allowlisted {
        matched.push("action_not_allowlisted".to_string());
        deny_reasons.push(format!(
            "action {} is not allowlisted in {}",
            input.action_type, input.environment
        ));
    }

    if !deny_reasons.is_empty() {
        return finish(input, PolicyDecision::Deny { reasons: deny_reasons }, matched);
    }

    let mut approval_reasons = Vec::new();
    if input.environment == Environment::Prod {
        matched.push("prod_environment".to_string());
        approval_reasons.push("prod_environment".to_string());
    }
    if input.environment == Environment::Staging
        && input.blast_radius_score >= config.staging_approval_blast_threshold
    {
        matched.push("staging_blast_radius".to_string());
        approval_reasons.push("staging_blast_radius".to_string());
    }
    if !in_dev && config.approval_required_actions.contains(&input.action_type) {
        matched.push("action_class".to_string());
        approval_reasons.push("action_class".to_string());
    }
    if !in_dev && input.affected_replicas >= config.replica_approval_threshold {
        matched.push("replica_count".to_string());
        approval_reasons.push("replica_count".to_string());
    }
    let in_freeze = input.current_hour >= config.freeze_hours_start
        || input.current_hour < config.freeze_hours_end
        || (input.environment == Environment::Prod && input.is_weekend)
        || input.freeze_active;
    if in_freeze {
        matched.push("freeze_window".to_string());
        approval_reasons.push("freeze_window".to_string());
    }

    let decision = if approval_reasons.is_empty() {
        PolicyDecision::Allow
    } else {
        PolicyDecision::RequireApproval {
            reasons: approval_reasons,
        }
    };
    finish(input, decision, matched)
}

fn finish(
    input: &PolicyInput,
    decision: PolicyDecision,
    matched_rules: Vec<String>,
) -> PolicyEvaluation {
    info!(
        action = %input.action_type,
        environment = %input.environment,
        decision = ?decision,
        "policy gate evaluated"
    );
    PolicyEvaluation {
        id: Uuid::new_v4(),
        input: input.clone(),
        decision,
        matched_rules,
        evaluated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_input(environment: Environment, action_type: ActionType) -> PolicyInput {
        PolicyInput {
            environment,
            action_type,
            namespace: "payments".to_string(),
            blast_radius_score: 20.0,
            affected_replicas: 1,
            current_hour: 14,
            is_weekend: false,
            freeze_active: false,
        }
    }

    #[test]
    fn test_dev_low_risk_allows() {
        let config = PolicyConfig::default();
        let eval = evaluate(&base_input(Environment::Dev, ActionType::RestartPod), &config);
        assert_eq!(eval.decision, PolicyDecision::Allow);
        assert!(eval.matched_rules.is_empty());
    }

    #[test]
    fn test_dev_rollback_allowed_without_approval() {
        // Action-class and replica-count gating apply outside dev only.
        let config = PolicyConfig::default();
        let mut input = base_input(Environment::Dev, ActionType::RollbackDeployment);
        input.affected_replicas = 3;
        let eval = evaluate(&input, &config);
        assert_eq!(eval.decision, PolicyDecision::Allow);
    }

    #[test]
    fn test_staging_rollback_needs_approval_for_action_class() {
        let config = PolicyConfig::default();
        let eval = evaluate(
            &base_input(Environment::Staging, ActionType::RollbackDeployment),
            &config,
        );
        assert!(eval.decision.requires_approval());
        assert!(eval.matched_rules.contains(&"action_class".to_string()));
    }

    #[test]
    fn test_high_risk_action_denied_outside_dev() {
        let config = PolicyConfig::default();
        let eval = evaluate(
            &base_input(Environment::Prod, ActionType::UpdateResourceLimits),
            &config,
        );
        assert!(eval.decision.is_deny());
        assert!(eval.matched_rules.contains(&"high_risk_action".to_string()));

        // But allowed through the high-risk check in dev (still subject to
        // the dev allowlist, which excludes it).
        let eval = evaluate(
            &base_input(Environment::Dev, ActionType::UpdateResourceLimits),
            &config,
        );
        assert!(!eval.matched_rules.contains(&"high_risk_action".to_string()));
    }

    #[test]
    fn test_protected_namespace_denied_in_prod() {
        let config = PolicyConfig::default();
        let mut input = base_input(Environment::Prod, ActionType::RestartPod);
        input.namespace = "kube-system".to_string();
        let eval = evaluate(&input, &config);
        assert!(eval.decision.is_deny());
        assert!(eval
            .matched_rules
            .contains(&"protected_namespace".to_string()));
    }

    #[test]
    fn test_protected_namespace_allowed_in_dev() {
        let config = PolicyConfig::default();
        let mut input = base_input(Environment::Dev, ActionType::RestartPod);
        input.namespace = "kube-system".to_string();
        let eval = evaluate(&input, &config);
        assert!(!eval.decision.is_deny());
    }

    #[test]
    fn test_blast_radius_boundary_prod() {
        let config = PolicyConfig::default();
        let mut input = base_input(Environment::Prod, ActionType::RestartPod);

        input.blast_radius_score = 49.0;
        assert!(!evaluate(&input, &config).decision.is_deny());

        input.blast_radius_score = 50.0;
        assert!(evaluate(&input, &config).decision.is_deny());
    }

    #[test]
    fn test_blast_radius_boundary_staging() {
        let config = PolicyConfig::default();
        let mut input = base_input(Environment::Staging, ActionType::RestartPod);

        input.blast_radius_score = 74.0;
        assert!(!evaluate(&input, &config).decision.is_deny());

        input.blast_radius_score = 75.0;
        assert!(evaluate(&input, &config).decision.is_deny());
    }

    #[test]
    fn test_blast_radius_unbounded_in_dev() {
        let config = PolicyConfig::default();
        let mut input = base_input(Environment::Dev, ActionType::RestartPod);
        input.blast_radius_score = 99.0;
        assert_eq!(evaluate(&input, &config).decision, PolicyDecision::Allow);
    }

    #[test]
    fn test_replica_limit_denies_outside_dev() {
        let config = PolicyConfig::default();
        let mut input = base_input(Environment::Staging, ActionType::RestartPod);
        input.affected_replicas = 5;
        assert!(evaluate(&input, &config).decision.is_deny());

        input.affected_replicas = 4;
        let eval = evaluate(&input, &config);
        assert!(!eval.decision.is_deny());
        // 4 >= 3 still needs approval.
        assert!(eval.decision.requires_approval());
    }

    #[test]
    fn test_allowlist_denies_unlisted_action() {
        let config = PolicyConfig::default();
        // rollback_deployment is not allowlisted in prod.
        let eval = evaluate(
            &base_input(Environment::Prod, ActionType::RollbackDeployment),
            &config,
        );
        assert!(eval.decision.is_deny());
        assert!(eval
            .matched_rules
            .contains(&"action_not_allowlisted".to_string()));
    }

    #[test]
    fn test_prod_always_requires_approval() {
        let config = PolicyConfig::default();
        let eval = evaluate(&base_input(Environment::Prod, ActionType::RestartPod), &config);
        match eval.decision {
            PolicyDecision::RequireApproval { ref reasons } => {
                assert!(reasons.contains(&"prod_environment".to_string()));
            }
            other => panic!("expected approval, got {:?}", other),
        }
    }

    #[test]
    fn test_staging_blast_approval_threshold() {
        let config = PolicyConfig::default();
        let mut input = base_input(Environment::Staging, ActionType::RestartPod);
        input.blast_radius_score = 30.0;
        assert!(evaluate(&input, &config).decision.requires_approval());

        input.blast_radius_score = 29.0;
        assert_eq!(evaluate(&input, &config).decision, PolicyDecision::Allow);
    }

    #[test]
    fn test_freeze_window_boundaries() {
        let config = PolicyConfig::default();
        let mut input = base_input(Environment::Staging, ActionType::RestartPod);

        input.current_hour = 22;
        let eval = evaluate(&input, &config);
        assert!(eval.matched_rules.contains(&"freeze_window".to_string()));

        input.current_hour = 21;
        let eval = evaluate(&input, &config);
        assert!(!eval.matched_rules.contains(&"freeze_window".to_string()));

        input.current_hour = 5;
        let eval = evaluate(&input, &config);
        assert!(eval.matched_rules.contains(&"freeze_window".to_string()));

        input.current_hour = 6;
        let eval = evaluate(&input, &config);
        assert!(!eval.matched_rules.contains(&"freeze_window".to_string()));
    }

    #[test]
    fn test_prod_weekend_is_frozen() {
        let config = PolicyConfig::default();
        let mut input = base_input(Environment::Prod, ActionType::RestartPod);
        input.is_weekend = true;
        let eval = evaluate(&input, &config);
        assert!(eval.matched_rules.contains(&"freeze_window".to_string()));

        // Weekend alone does not freeze staging.
        let mut input = base_input(Environment::Staging, ActionType::RestartPod);
        input.is_weekend = true;
        let eval = evaluate(&input, &config);
        assert!(!eval.matched_rules.contains(&"freeze_window".to_string()));
    }

    #[test]
    fn test_operator_freeze_flag() {
        let config = PolicyConfig::default();
        let mut input = base_input(Environment::Staging, ActionType::RestartPod);
        input.freeze_active = true;
        let eval = evaluate(&input, &config);
        assert!(eval.decision.requires_approval());
        assert!(eval.matched_rules.contains(&"freeze_window".to_string()));
    }

    #[test]
    fn test_gate_is_pure() {
        let config = PolicyConfig::default();
        let input = base_input(Environment::Prod, ActionType::RestartPod);
        let a = evaluate(&input, &config);
        let b = evaluate(&input, &config);
        assert_eq!(a.decision, b.decision);
        assert_eq!(a.matched_rules, b.matched_rules);
        assert_eq!(a.input, b.input);
    }

    #[test]
    fn test_prod_freeze_at_23_reports_freeze_window() {
        let config = PolicyConfig::default();
        let mut input = base_input(Environment::Prod, ActionType::RestartPod);
        input.current_hour = 23;
        let eval = evaluate(&input, &config);
        match eval.decision {
            PolicyDecision::RequireApproval { reasons } => {
                assert!(reasons.contains(&"freeze_window".to_string()));
            }
            other => panic!("expected approval, got {:?}", other),
        }
    }
}
