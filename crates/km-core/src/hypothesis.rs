//! Causal hypothesis model.
//!
//! Hypotheses are produced by the rules engine, scored, and densely ranked
//! per incident. LLM enrichment may rewrite the prose fields only.

use crate::action::ActionType;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Root-cause categories.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HypothesisCategory {
    BadDeploy,
    ExternalDependency,
    MemoryExhaustion,
    ImageIssue,
    ScalingLimit,
    Infrastructure,
    ConfigDrift,
    Network,
    ResourceContention,
    Unknown,
}

impl HypothesisCategory {
    /// Tie-break priority for ranking; lower index wins.
    pub fn priority(&self) -> usize {
        match self {
            HypothesisCategory::MemoryExhaustion => 0,
            HypothesisCategory::ImageIssue => 1,
            HypothesisCategory::BadDeploy => 2,
            HypothesisCategory::Infrastructure => 3,
            HypothesisCategory::ScalingLimit => 4,
            HypothesisCategory::ExternalDependency => 5,
            HypothesisCategory::ConfigDrift => 6,
            HypothesisCategory::Network => 7,
            HypothesisCategory::ResourceContention => 8,
            HypothesisCategory::Unknown => 9,
        }
    }

    /// Confidence multiplier applied during scoring.
    ///
    /// Weights descend with priority so weighting and tie-breaking agree.
    pub fn weight(&self) -> f64 {
        match self {
            HypothesisCategory::MemoryExhaustion => 1.20,
            HypothesisCategory::ImageIssue => 1.15,
            HypothesisCategory::BadDeploy => 1.10,
            HypothesisCategory::Infrastructure => 1.05,
            HypothesisCategory::ScalingLimit => 1.00,
            HypothesisCategory::ExternalDependency => 0.95,
            HypothesisCategory::ConfigDrift => 0.90,
            HypothesisCategory::Network => 0.85,
            HypothesisCategory::ResourceContention => 0.80,
            HypothesisCategory::Unknown => 0.50,
        }
    }
}

impl std::fmt::Display for HypothesisCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HypothesisCategory::BadDeploy => "bad_deploy",
            HypothesisCategory::ExternalDependency => "external_dependency",
            HypothesisCategory::MemoryExhaustion => "memory_exhaustion",
            HypothesisCategory::ImageIssue => "image_issue",
            HypothesisCategory::ScalingLimit => "scaling_limit",
            HypothesisCategory::Infrastructure => "infrastructure",
            HypothesisCategory::ConfigDrift => "config_drift",
            HypothesisCategory::Network => "network",
            HypothesisCategory::ResourceContention => "resource_contention",
            HypothesisCategory::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// What produced a hypothesis.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum GeneratedBy {
    #[serde(rename = "rules")]
    Rules,
    #[serde(rename = "rules+llm")]
    RulesLlm,
}

/// A candidate causal explanation for an incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hypothesis {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub category: HypothesisCategory,
    pub title: String,
    pub description: String,
    /// Final score in [0, 1].
    pub confidence: f64,
    /// Dense rank per incident; 1 is the top hypothesis.
    pub rank: u32,
    pub supporting_evidence_ids: Vec<Uuid>,
    pub contradicting_evidence_ids: Vec<Uuid>,
    /// Remediation actions this hypothesis recommends, best first.
    pub recommended_actions: Vec<ActionType>,
    pub generated_by: GeneratedBy,
}

impl Hypothesis {
    pub fn new(
        incident_id: Uuid,
        category: HypothesisCategory,
        title: &str,
        description: &str,
        confidence: f64,
        recommended_actions: Vec<ActionType>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            incident_id,
            category,
            title: title.to_string(),
            description: description.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            rank: 0,
            supporting_evidence_ids: Vec::new(),
            contradicting_evidence_ids: Vec::new(),
            recommended_actions,
            generated_by: GeneratedBy::Rules,
        }
    }
}
