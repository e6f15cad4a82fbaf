//! Rules engine for deterministic root-cause hypothesis generation.
//!
//! A rule is a predicate over the signal map plus a hypothesis template with
//! a base confidence, category, and recommended actions. Rules are
//! declarative, deterministic, and order-independent; ranking alone decides
//! presentation order.

use crate::action::ActionType;
use crate::evidence::{Evidence, LogPatternClass};
use crate::hypothesis::{Hypothesis, HypothesisCategory};
use crate::signals::{extract_signals, SignalMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Confidence ceiling after scoring.
const CONFIDENCE_CAP: f64 = 0.99;

/// At most this many evidence ids are attached as support.
const MAX_SUPPORTING_EVIDENCE: usize = 5;

/// Tunable thresholds referenced by rule predicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleThresholds {
    /// Error log lines per minute above which logs count as a signal.
    #[serde(default = "default_error_log_rate")]
    pub error_log_rate: f64,
    /// p99 latency (seconds) above which latency counts as a signal.
    #[serde(default = "default_latency_p99")]
    pub latency_p99_secs: f64,
    /// Memory usage ratio treated as imminent OOM.
    #[serde(default = "default_memory_ratio")]
    pub memory_ratio: f64,
    /// Memory usage ratio treated as pressure short of OOM.
    #[serde(default = "default_memory_pressure_ratio")]
    pub memory_pressure_ratio: f64,
}

fn default_error_log_rate() -> f64 {
    1.0
}

fn default_latency_p99() -> f64 {
    1.0
}

fn default_memory_ratio() -> f64 {
    0.95
}

fn default_memory_pressure_ratio() -> f64 {
    0.90
}

impl Default for RuleThresholds {
    fn default() -> Self {
        Self {
            error_log_rate: default_error_log_rate(),
            latency_p99_secs: default_latency_p99(),
            memory_ratio: default_memory_ratio(),
            memory_pressure_ratio: default_memory_pressure_ratio(),
        }
    }
}

/// One diagnosis rule: predicate plus hypothesis template.
pub struct DiagnosisRule {
    pub key: &'static str,
    pub category: HypothesisCategory,
    pub base_confidence: f64,
    pub title: &'static str,
    pub description: &'static str,
    pub recommended_actions: &'static [ActionType],
    pub predicate: fn(&SignalMap, &RuleThresholds) -> bool,
}

/// The built-in diagnosis rule library.
pub fn builtin_rules() -> Vec<DiagnosisRule> {
    vec![
        DiagnosisRule {
            key: "bad_deploy_crashloop",
            category: HypothesisCategory::BadDeploy,
            base_confidence: 0.90,
            title: "Recent deployment caused application crash",
            description: "The application began crash looping right after a deployment. \
                The new revision likely fails on startup.",
            recommended_actions: &[ActionType::RollbackDeployment],
            predicate: |s, _| {
                s.waiting_reasons.contains("CrashLoopBackOff") && s.has_recent_deploy
            },
        },
        DiagnosisRule {
            key: "external_dependency_crashloop",
            category: HypothesisCategory::ExternalDependency,
            base_confidence: 0.75,
            title: "Crash loop without a recent deploy",
            description: "The application is crash looping with no recent deployment and \
                a high error log rate, pointing at an external dependency or data issue.",
            recommended_actions: &[ActionType::RestartPod],
            predicate: |s, t| {
                s.waiting_reasons.contains("CrashLoopBackOff")
                    && !s.has_recent_deploy
                    && s.error_log_rate > t.error_log_rate
            },
        },
        DiagnosisRule {
            key: "oom_killed",
            category: HypothesisCategory::MemoryExhaustion,
            base_confidence: 0.95,
            title: "Container killed on memory limit",
            description: "A container was OOMKilled or memory usage sits at the limit. \
                Either the limit is too low or the application leaks memory.",
            recommended_actions: &[ActionType::RestartPod, ActionType::UpdateResourceLimits],
            predicate: |s, t| {
                s.terminated_reasons.contains("OOMKilled") || s.memory_usage_ratio >= t.memory_ratio
            },
        },
        DiagnosisRule {
            key: "image_pull_failure",
            category: HypothesisCategory::ImageIssue,
            base_confidence: 0.95,
            title: "Container image cannot be pulled",
            description: "Pods are stuck failing to pull their image: bad tag, registry \
                auth, or registry connectivity.",
            recommended_actions: &[ActionType::RollbackDeployment],
            predicate: |s, _| {
                s.waiting_reasons.contains("ImagePullBackOff")
                    || s.waiting_reasons.contains("ErrImagePull")
            },
        },
        DiagnosisRule {
            key: "hpa_maxed",
            category: HypothesisCategory::ScalingLimit,
            base_confidence: 0.80,
            title: "Autoscaler at maximum with high latency",
            description: "The HPA is pinned at max replicas while p99 latency stays \
                elevated; the service needs more capacity than configured.",
            recommended_actions: &[ActionType::ScaleReplicas],
            predicate: |s, t| s.hpa_at_max && s.latency_p99 > t.latency_p99_secs,
        },
        DiagnosisRule {
            key: "node_unhealthy",
            category: HypothesisCategory::Infrastructure,
            base_confidence: 0.85,
            title: "Failures isolated to an unhealthy node",
            description: "Multiple pods are failing on the same node and the node \
                reports unhealthy conditions. The node is the likely root cause.",
            recommended_actions: &[ActionType::CordonNode],
            predicate: |s, _| s.node_unhealthy && s.pod_failures_on_node > 1,
        },
        DiagnosisRule {
            key: "container_config_error",
            category: HypothesisCategory::ConfigDrift,
            base_confidence: 0.90,
            title: "Container configuration error",
            description: "Containers cannot be created: missing volumes, bad env var \
                references, or an invalid security context.",
            recommended_actions: &[ActionType::RestartDeployment],
            predicate: |s, _| {
                s.waiting_reasons.contains("CreateContainerConfigError")
                    || s.terminated_reasons.contains("CreateContainerConfigError")
            },
        },
        DiagnosisRule {
            key: "network_connectivity",
            category: HypothesisCategory::Network,
            base_confidence: 0.70,
            title: "Network connectivity problems",
            description: "Logs show connection refusals or timeouts at a high rate; \
                DNS, service mesh, or network policy issues are likely.",
            recommended_actions: &[ActionType::RestartPod],
            predicate: |s, t| {
                (s.log_patterns.contains(&LogPatternClass::ConnectionRefused)
                    || s.log_patterns.contains(&LogPatternClass::Timeout))
                    && s.error_log_rate > t.error_log_rate
            },
        },
        DiagnosisRule {
            key: "memory_pressure",
            category: HypothesisCategory::MemoryExhaustion,
            base_confidence: 0.80,
            title: "Memory usage approaching the limit",
            description: "Memory usage is over the pressure threshold and the workload \
                risks an OOMKill soon.",
            recommended_actions: &[
                ActionType::UpdateResourceLimits,
                ActionType::RestartDeployment,
            ],
            predicate: |s, t| {
                s.memory_usage_ratio >= t.memory_pressure_ratio
                    && !s.terminated_reasons.contains("OOMKilled")
            },
        },
    ]
}

/// Scores a matched rule.
///
/// `confidence = base x category_weight x clip(0.5 + 0.1 * supporting, 0, 1.2)`,
/// minus 0.1 per contradicting evidence, clamped to `[0, 0.99]`.
pub fn score_confidence(
    base: f64,
    category: HypothesisCategory,
    supporting: usize,
    contradicting: usize,
) -> f64 {
    let support_factor = (0.5 + 0.1 * supporting as f64).clamp(0.0, 1.2);
    let raw = base * category.weight() * support_factor - 0.1 * contradicting as f64;
    raw.clamp(0.0, CONFIDENCE_CAP)
}

/// Assigns dense ranks: descending confidence, ties broken by category
/// priority, then rule-insertion order (stable sort).
pub fn rank_hypotheses(hypotheses: &mut [Hypothesis]) {
    hypotheses.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.category.priority().cmp(&b.category.priority()))
    });
    for (i, h) in hypotheses.iter_mut().enumerate() {
        h.rank = (i + 1) as u32;
    }
}

/// Deterministic rules engine over an incident's evidence set.
pub struct RulesEngine {
    rules: Vec<DiagnosisRule>,
    thresholds: RuleThresholds,
}

impl RulesEngine {
    pub fn new(thresholds: RuleThresholds) -> Self {
        Self {
            rules: builtin_rules(),
            thresholds,
        }
    }

    /// Generates ranked hypotheses. At least one is always returned; when no
    /// rule fires, a single `unknown` hypothesis with confidence 0.2 is
    /// emitted.
    pub fn generate(&self, incident_id: Uuid, evidence: &[Evidence]) -> Vec<Hypothesis> {
        let signals = extract_signals(evidence);
        let supporting: Vec<Uuid> = signals
            .strong_evidence_ids
            .iter()
            .copied()
            .take(MAX_SUPPORTING_EVIDENCE)
            .collect();

        let mut hypotheses = Vec::new();
        for rule in &self.rules {
            if !(rule.predicate)(&signals, &self.thresholds) {
                continue;
            }
            let confidence =
                score_confidence(rule.base_confidence, rule.category, supporting.len(), 0);
            debug!(rule = rule.key, confidence, "diagnosis rule matched");
            let mut hypothesis = Hypothesis::new(
                incident_id,
                rule.category,
                rule.title,
                rule.description,
                confidence,
                rule.recommended_actions.to_vec(),
            );
            hypothesis.supporting_evidence_ids = supporting.clone();
            hypotheses.push(hypothesis);
        }

        if hypotheses.is_empty() {
            let mut unknown = Hypothesis::new(
                incident_id,
                HypothesisCategory::Unknown,
                "Unknown issue",
                "No diagnosis rule matched the collected evidence. Manual \
                 investigation required.",
                0.2,
                vec![],
            );
            unknown.supporting_evidence_ids = supporting;
            hypotheses.push(unknown);
        }

        rank_hypotheses(&mut hypotheses);
        info!(
            incident_id = %incident_id,
            count = hypotheses.len(),
            top = %hypotheses[0].category,
            "hypotheses ranked"
        );
        hypotheses
    }
}

impl Default for RulesEngine {
    fn default() -> Self {
        Self::new(RuleThresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{signal, EvidenceData, EvidenceSource, MetricKind, TimeWindow};

    fn evidence(data: EvidenceData, strength: f64) -> Evidence {
        Evidence::new(
            Uuid::new_v4(),
            EvidenceSource::K8s,
            "api",
            "payments",
            data,
            strength,
            TimeWindow::last_minutes(15),
        )
    }

    fn crashloop_pod() -> Evidence {
        evidence(
            EvidenceData::PodState {
                name: "api-7f".to_string(),
                phase: "Running".to_string(),
                node_name: Some("node-1".to_string()),
                restart_count: 15,
                waiting_reason: Some("CrashLoopBackOff".to_string()),
                terminated_reason: None,
                ready: false,
            },
            signal::TERMINAL,
        )
    }

    fn recent_deploy() -> Evidence {
        evidence(
            EvidenceData::DeployHistory {
                deployment: "api".to_string(),
                current_revision: 42,
                previous_revision: Some(41),
                current_images: vec!["api:1.3.0".to_string()],
                previous_images: vec!["api:1.2.9".to_string()],
                image_changed: true,
                config_hash_changed: false,
                deployed_at: Some(chrono::Utc::now()),
                is_recent: true,
            },
            signal::DEPLOY_CORRELATED,
        )
    }

    fn error_logs(rate: f64) -> Evidence {
        evidence(
            EvidenceData::LogsPattern {
                total_lines: 400,
                error_count: 300,
                patterns: vec![LogPatternClass::Error, LogPatternClass::ConnectionRefused],
                error_rate_per_minute: rate,
                sample_stack_traces: vec![],
            },
            signal::HIGH_RESTARTS,
        )
    }

    #[test]
    fn test_bad_deploy_rule_tops_ranking() {
        let engine = RulesEngine::default();
        let evidence_set = vec![
            crashloop_pod(),
            recent_deploy(),
            error_logs(20.0),
            evidence(
                EvidenceData::MetricSample {
                    metric: MetricKind::RestartCountDelta,
                    value: 15.0,
                },
                signal::HIGH_RESTARTS,
            ),
        ];
        let hypotheses = engine.generate(Uuid::new_v4(), &evidence_set);
        let top = &hypotheses[0];
        assert_eq!(top.category, HypothesisCategory::BadDeploy);
        assert_eq!(top.rank, 1);
        // base 0.90 x weight 1.10 x support factor 0.9 (4 strong items)
        assert!(top.confidence > 0.85 && top.confidence < 0.95);
        assert_eq!(top.recommended_actions, vec![ActionType::RollbackDeployment]);
        // External-dependency rule must not fire alongside a recent deploy.
        assert!(!hypotheses
            .iter()
            .any(|h| h.category == HypothesisCategory::ExternalDependency));
    }

    #[test]
    fn test_oom_rule_confidence_floor() {
        let engine = RulesEngine::default();
        let evidence_set = vec![
            evidence(
                EvidenceData::PodState {
                    name: "api-7f".to_string(),
                    phase: "Running".to_string(),
                    node_name: None,
                    restart_count: 4,
                    waiting_reason: None,
                    terminated_reason: Some("OOMKilled".to_string()),
                    ready: false,
                },
                signal::TERMINAL,
            ),
            evidence(
                EvidenceData::MetricSample {
                    metric: MetricKind::MemoryUsageRatio,
                    value: 0.98,
                },
                signal::DEPLOY_CORRELATED,
            ),
            error_logs(3.0),
            crashloop_pod(),
        ];
        let hypotheses = engine.generate(Uuid::new_v4(), &evidence_set);
        let top = &hypotheses[0];
        assert_eq!(top.category, HypothesisCategory::MemoryExhaustion);
        assert!(top.confidence >= 0.95);
        assert!(top
            .recommended_actions
            .contains(&ActionType::UpdateResourceLimits));
        assert!(top.recommended_actions.contains(&ActionType::RestartPod));
    }

    #[test]
    fn test_image_pull_rule() {
        let engine = RulesEngine::default();
        let evidence_set = vec![evidence(
            EvidenceData::PodState {
                name: "api-7f".to_string(),
                phase: "Pending".to_string(),
                node_name: None,
                restart_count: 0,
                waiting_reason: Some("ImagePullBackOff".to_string()),
                terminated_reason: None,
                ready: false,
            },
            signal::TERMINAL,
        )];
        let hypotheses = engine.generate(Uuid::new_v4(), &evidence_set);
        assert_eq!(hypotheses[0].category, HypothesisCategory::ImageIssue);
        assert!(hypotheses[0].confidence >= 0.6);
        assert_eq!(
            hypotheses[0].recommended_actions,
            vec![ActionType::RollbackDeployment]
        );
    }

    #[test]
    fn test_unknown_fallback() {
        let engine = RulesEngine::default();
        let hypotheses = engine.generate(Uuid::new_v4(), &[]);
        assert_eq!(hypotheses.len(), 1);
        assert_eq!(hypotheses[0].category, HypothesisCategory::Unknown);
        assert_eq!(hypotheses[0].confidence, 0.2);
        assert_eq!(hypotheses[0].rank, 1);
    }

    #[test]
    fn test_ranks_are_dense_and_unique() {
        let engine = RulesEngine::default();
        // Fire several rules at once.
        let evidence_set = vec![
            crashloop_pod(),
            recent_deploy(),
            error_logs(20.0),
            evidence(
                EvidenceData::MetricSample {
                    metric: MetricKind::MemoryUsageRatio,
                    value: 0.98,
                },
                signal::TERMINAL,
            ),
            evidence(
                EvidenceData::HpaState {
                    name: "api".to_string(),
                    current_replicas: 10,
                    min_replicas: 2,
                    max_replicas: 10,
                    at_max: true,
                    target_deployment: "api".to_string(),
                },
                signal::HIGH_RESTARTS,
            ),
            evidence(
                EvidenceData::MetricSample {
                    metric: MetricKind::P99Latency,
                    value: 3.0,
                },
                signal::HIGH_RESTARTS,
            ),
        ];
        let hypotheses = engine.generate(Uuid::new_v4(), &evidence_set);
        assert!(hypotheses.len() >= 3);
        let ranks: Vec<u32> = hypotheses.iter().map(|h| h.rank).collect();
        let expected: Vec<u32> = (1..=hypotheses.len() as u32).collect();
        assert_eq!(ranks, expected);
    }

    #[test]
    fn test_generation_is_deterministic() {
        let engine = RulesEngine::default();
        let evidence_set = vec![crashloop_pod(), recent_deploy(), error_logs(20.0)];
        let incident_id = Uuid::new_v4();
        let a = engine.generate(incident_id, &evidence_set);
        let b = engine.generate(incident_id, &evidence_set);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.category, y.category);
            assert_eq!(x.confidence, y.confidence);
            assert_eq!(x.rank, y.rank);
        }
    }

    #[test]
    fn test_ties_broken_by_category_priority() {
        let incident_id = Uuid::new_v4();
        let mut hypotheses = vec![
            Hypothesis::new(
                incident_id,
                HypothesisCategory::ScalingLimit,
                "a",
                "",
                0.8,
                vec![],
            ),
            Hypothesis::new(
                incident_id,
                HypothesisCategory::ImageIssue,
                "b",
                "",
                0.8,
                vec![],
            ),
            Hypothesis::new(
                incident_id,
                HypothesisCategory::Infrastructure,
                "c",
                "",
                0.8,
                vec![],
            ),
        ];
        rank_hypotheses(&mut hypotheses);
        assert_eq!(hypotheses[0].category, HypothesisCategory::ImageIssue);
        assert_eq!(hypotheses[1].category, HypothesisCategory::Infrastructure);
        assert_eq!(hypotheses[2].category, HypothesisCategory::ScalingLimit);
    }

    #[test]
    fn test_contradicting_evidence_subtracts() {
        let clean = score_confidence(0.9, HypothesisCategory::BadDeploy, 5, 0);
        let contradicted = score_confidence(0.9, HypothesisCategory::BadDeploy, 5, 2);
        assert!((clean - contradicted - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_support_factor_clipped() {
        // 12 supporting items would exceed the 1.2 clip.
        let capped = score_confidence(0.5, HypothesisCategory::ScalingLimit, 50, 0);
        let at_clip = score_confidence(0.5, HypothesisCategory::ScalingLimit, 7, 0);
        assert_eq!(capped, at_clip);
    }
}
