//! Blast radius scoring.
//!
//! Estimates the impact of a proposed remediation on a 0-100 scale from the
//! affected replica fraction, namespace criticality, environment, and the
//! action's inherent risk.

use km_core::{ActionType, Environment, RiskLevel};
use serde::{Deserialize, Serialize};

/// Weights for the blast radius components. Components are each in [0, 1],
/// so the default weights put the score on a 0-100 scale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlastWeights {
    #[serde(default = "default_replica_weight")]
    pub replica_fraction: f64,
    #[serde(default = "default_criticality_weight")]
    pub namespace_criticality: f64,
    #[serde(default = "default_environment_weight")]
    pub environment: f64,
    #[serde(default = "default_risk_weight")]
    pub action_risk: f64,
}

fn default_replica_weight() -> f64 {
    40.0
}

fn default_criticality_weight() -> f64 {
    20.0
}

fn default_environment_weight() -> f64 {
    20.0
}

fn default_risk_weight() -> f64 {
    20.0
}

impl Default for BlastWeights {
    fn default() -> Self {
        Self {
            replica_fraction: default_replica_weight(),
            namespace_criticality: default_criticality_weight(),
            environment: default_environment_weight(),
            action_risk: default_risk_weight(),
        }
    }
}

/// Inputs to the blast radius computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlastRadiusInput {
    pub action_type: ActionType,
    pub risk_level: RiskLevel,
    pub affected_replicas: u32,
    pub total_replicas: u32,
    pub namespace: String,
    /// Criticality of the namespace in [0, 1].
    pub namespace_criticality: f64,
    pub environment: Environment,
}

/// The computed assessment, kept for the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlastRadiusAssessment {
    /// Final score in [0, 100].
    pub score: f64,
    pub replica_fraction: f64,
    pub namespace_criticality: f64,
    pub environment_weight: f64,
    pub action_risk_weight: f64,
    pub affected_replicas: u32,
}

/// Computes the blast radius score.
pub fn compute(input: &BlastRadiusInput, weights: &BlastWeights) -> BlastRadiusAssessment {
    let replica_fraction = if input.total_replicas == 0 {
        1.0
    } else {
        (input.affected_replicas as f64 / input.total_replicas as f64).clamp(0.0, 1.0)
    };
    let criticality = input.namespace_criticality.clamp(0.0, 1.0);
    let environment_weight = input.environment.weight();
    let action_risk_weight = input.risk_level.weight();

    let score = weights.replica_fraction * replica_fraction
        + weights.namespace_criticality * criticality
        + weights.environment * environment_weight
        + weights.action_risk * action_risk_weight;

    BlastRadiusAssessment {
        score: score.clamp(0.0, 100.0),
        replica_fraction,
        namespace_criticality: criticality,
        environment_weight,
        action_risk_weight,
        affected_replicas: input.affected_replicas,
    }
}
