//! Configuration loading for Kube Medic.

use crate::action::ActionType;
use crate::rules::RuleThresholds;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Deployment environments, ordered from least to most sensitive.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    /// Weight used by the blast radius formula.
    pub fn weight(&self) -> f64 {
        match self {
            Environment::Dev => 0.1,
            Environment::Staging => 0.5,
            Environment::Prod => 1.0,
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Dev => write!(f, "dev"),
            Environment::Staging => write!(f, "staging"),
            Environment::Prod => write!(f, "prod"),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Environment this instance operates in.
    #[serde(default = "default_environment")]
    pub environment: Environment,

    /// Evidence collection settings.
    #[serde(default)]
    pub collection: CollectionConfig,

    /// Post-remediation verification settings.
    #[serde(default)]
    pub verification: VerificationConfig,

    /// How long to wait for a human approval decision (seconds).
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,

    /// Remediation attempts allowed per incident.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    /// How far back a rollout counts as a recent deploy (minutes).
    #[serde(default = "default_deploy_lookback_minutes")]
    pub deploy_lookback_minutes: i64,

    /// Freeze window settings.
    #[serde(default)]
    pub freeze: FreezeConfig,

    /// Namespaces no remediation may touch outside dev.
    #[serde(default = "default_protected_namespaces")]
    pub protected_namespaces: BTreeSet<String>,

    /// Action types denied outright outside dev.
    #[serde(default = "default_high_risk_actions")]
    pub high_risk_actions: BTreeSet<ActionType>,

    /// Per-environment action allowlists.
    #[serde(default = "default_allowlists")]
    pub allowlists: BTreeMap<Environment, BTreeSet<ActionType>>,

    /// Criticality override per namespace, in [0, 1]; defaults apply
    /// otherwise.
    #[serde(default)]
    pub namespace_criticality: BTreeMap<String, f64>,

    /// Rule predicate thresholds.
    #[serde(default)]
    pub rules: RuleThresholds,
}

fn default_environment() -> Environment {
    Environment::Dev
}

fn default_approval_timeout_secs() -> u64 {
    4 * 3600
}

fn default_retry_budget() -> u32 {
    1
}

fn default_deploy_lookback_minutes() -> i64 {
    30
}

fn default_protected_namespaces() -> BTreeSet<String> {
    [
        "kube-system",
        "kube-public",
        "kube-node-lease",
        "istio-system",
        "cert-manager",
        "monitoring",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_high_risk_actions() -> BTreeSet<ActionType> {
    [
        ActionType::DrainNode,
        ActionType::DeletePvc,
        ActionType::UpdateResourceLimits,
        ActionType::DeleteNamespace,
        ActionType::UpdateConfigmap,
        ActionType::UncordonNode,
    ]
    .into_iter()
    .collect()
}

fn default_allowlists() -> BTreeMap<Environment, BTreeSet<ActionType>> {
    let mut map = BTreeMap::new();
    map.insert(
        Environment::Dev,
        [
            ActionType::RestartPod,
            ActionType::DeletePod,
            ActionType::RestartDeployment,
            ActionType::RollbackDeployment,
            ActionType::ScaleReplicas,
            ActionType::CordonNode,
        ]
        .into_iter()
        .collect(),
    );
    map.insert(
        Environment::Staging,
        [
            ActionType::RestartPod,
            ActionType::DeletePod,
            ActionType::RestartDeployment,
            ActionType::ScaleReplicas,
            ActionType::RollbackDeployment,
        ]
        .into_iter()
        .collect(),
    );
    map.insert(
        Environment::Prod,
        [
            ActionType::RestartPod,
            ActionType::DeletePod,
            ActionType::RestartDeployment,
            ActionType::ScaleReplicas,
        ]
        .into_iter()
        .collect(),
    );
    map
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            collection: CollectionConfig::default(),
            verification: VerificationConfig::default(),
            approval_timeout_secs: default_approval_timeout_secs(),
            retry_budget: default_retry_budget(),
            deploy_lookback_minutes: default_deploy_lookback_minutes(),
            freeze: FreezeConfig::default(),
            protected_namespaces: default_protected_namespaces(),
            high_risk_actions: default_high_risk_actions(),
            allowlists: default_allowlists(),
            namespace_criticality: BTreeMap::new(),
            rules: RuleThresholds::default(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Criticality factor for a namespace, in [0, 1].
    ///
    /// Protected namespaces default to 1.0, everything else to 0.5, unless
    /// overridden in `namespace_criticality`.
    pub fn criticality_of(&self, namespace: &str) -> f64 {
        if let Some(&v) = self.namespace_criticality.get(namespace) {
            return v.clamp(0.0, 1.0);
        }
        if self.protected_namespaces.contains(namespace) {
            1.0
        } else {
            0.5
        }
    }
}

/// Evidence collection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Overall budget for the parallel collection join (seconds).
    #[serde(default = "default_collection_total_secs")]
    pub deadline_total_secs: u64,
    /// Deadline per collector (seconds).
    #[serde(default = "default_collection_per_source_secs")]
    pub deadline_per_source_secs: u64,
    /// How far back evidence is gathered relative to incident start.
    #[serde(default = "default_evidence_window_minutes")]
    pub evidence_window_minutes: i64,
}

fn default_collection_total_secs() -> u64 {
    300
}

fn default_collection_per_source_secs() -> u64 {
    60
}

fn default_evidence_window_minutes() -> i64 {
    15
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            deadline_total_secs: default_collection_total_secs(),
            deadline_per_source_secs: default_collection_per_source_secs(),
            evidence_window_minutes: default_evidence_window_minutes(),
        }
    }
}

/// Post-remediation verification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Wait after execution before re-querying metrics (seconds).
    #[serde(default = "default_verification_delay_secs")]
    pub delay_secs: u64,
    /// Error rate must drop below `before * ratio` to count as improved.
    #[serde(default = "default_error_improvement_ratio")]
    pub error_improvement_ratio: f64,
    /// Error rate below this floor passes regardless of the ratio.
    #[serde(default = "default_error_rate_floor")]
    pub error_rate_floor: f64,
    /// Minimum fraction of pods ready.
    #[serde(default = "default_ready_ratio_min")]
    pub ready_ratio_min: f64,
}

fn default_verification_delay_secs() -> u64 {
    120
}

fn default_error_improvement_ratio() -> f64 {
    0.5
}

fn default_error_rate_floor() -> f64 {
    0.01
}

fn default_ready_ratio_min() -> f64 {
    0.9
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            delay_secs: default_verification_delay_secs(),
            error_improvement_ratio: default_error_improvement_ratio(),
            error_rate_floor: default_error_rate_floor(),
            ready_ratio_min: default_ready_ratio_min(),
        }
    }
}

/// Freeze window settings. Inside the window every action needs approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreezeConfig {
    /// Hour (0-23, inclusive) the nightly freeze starts.
    #[serde(default = "default_freeze_start")]
    pub hours_start: u32,
    /// Hour (0-23, exclusive) the nightly freeze ends.
    #[serde(default = "default_freeze_end")]
    pub hours_end: u32,
    /// Operator-declared freeze, independent of the clock.
    #[serde(default)]
    pub active: bool,
}

fn default_freeze_start() -> u32 {
    22
}

fn default_freeze_end() -> u32 {
    6
}

impl Default for FreezeConfig {
    fn default() -> Self {
        Self {
            hours_start: default_freeze_start(),
            hours_end: default_freeze_end(),
            active: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_policy() {
        let config = AppConfig::default();
        assert_eq!(config.environment, Environment::Dev);
        assert_eq!(config.approval_timeout_secs, 14400);
        assert_eq!(config.retry_budget, 1);
        assert_eq!(config.deploy_lookback_minutes, 30);
        assert_eq!(config.collection.deadline_per_source_secs, 60);
        assert_eq!(config.collection.deadline_total_secs, 300);
        assert_eq!(config.verification.delay_secs, 120);
        assert!(config.protected_namespaces.contains("kube-system"));
        assert!(config.high_risk_actions.contains(&ActionType::DrainNode));
        assert!(config
            .high_risk_actions
            .contains(&ActionType::UncordonNode));
    }

    #[test]
    fn test_default_allowlists_per_environment() {
        let config = AppConfig::default();
        let dev = &config.allowlists[&Environment::Dev];
        let staging = &config.allowlists[&Environment::Staging];
        let prod = &config.allowlists[&Environment::Prod];

        assert!(dev.contains(&ActionType::CordonNode));
        assert!(staging.contains(&ActionType::RollbackDeployment));
        assert!(!staging.contains(&ActionType::CordonNode));
        assert!(!prod.contains(&ActionType::RollbackDeployment));
        assert!(prod.contains(&ActionType::RestartPod));
    }

    #[test]
    fn test_environment_weight() {
        assert_eq!(Environment::Dev.weight(), 0.1);
        assert_eq!(Environment::Staging.weight(), 0.5);
        assert_eq!(Environment::Prod.weight(), 1.0);
    }

    #[test]
    fn test_criticality_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.criticality_of("kube-system"), 1.0);
        assert_eq!(config.criticality_of("payments"), 0.5);
    }

    #[test]
    fn test_criticality_override() {
        let mut config = AppConfig::default();
        config
            .namespace_criticality
            .insert("payments".to_string(), 0.9);
        assert_eq!(config.criticality_of("payments"), 0.9);
    }

    #[test]
    fn test_parse_partial_yaml_applies_defaults() {
        let yaml = "environment: prod\nretry_budget: 2\n";
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.environment, Environment::Prod);
        assert_eq!(config.retry_budget, 2);
        assert_eq!(config.approval_timeout_secs, 14400);
        assert_eq!(config.freeze.hours_start, 22);
        assert_eq!(config.freeze.hours_end, 6);
    }

    #[test]
    fn test_config_yaml_round_trip() {
        let config = AppConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let back: AppConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.environment, config.environment);
        assert_eq!(back.allowlists, config.allowlists);
        assert_eq!(back.protected_namespaces, config.protected_namespaces);
    }
}
