//! Signal extraction.
//!
//! Reduces the collected evidence set into a flat signal map the diagnosis
//! rules match against. Extraction is deterministic and order-independent:
//! scalar signals take the maximum observed value, set signals take unions.

use crate::evidence::{Evidence, EvidenceData, LogPatternClass, MetricKind};
use std::collections::{BTreeSet, HashMap, HashSet};
use uuid::Uuid;

/// Flat signal map extracted from an incident's evidence set.
#[derive(Debug, Clone, Default)]
pub struct SignalMap {
    pub waiting_reasons: BTreeSet<String>,
    pub terminated_reasons: BTreeSet<String>,
    pub restart_count: u32,
    pub has_recent_deploy: bool,
    pub image_changed: bool,
    pub memory_usage_ratio: f64,
    pub node_unhealthy: bool,
    pub pod_failures_on_node: u32,
    pub hpa_at_max: bool,
    pub error_log_rate: f64,
    pub http_5xx_rate: f64,
    pub log_patterns: HashSet<LogPatternClass>,
    pub image_pull_failed: bool,
    pub latency_p99: f64,
    pub failed_events: u32,
    /// Evidence with meaningful signal strength, in collection order.
    pub strong_evidence_ids: Vec<Uuid>,
}

impl SignalMap {
    /// True when any image-pull waiting reason was observed.
    fn note_waiting_reason(&mut self, reason: &str) {
        if reason == "ImagePullBackOff" || reason == "ErrImagePull" {
            self.image_pull_failed = true;
        }
        self.waiting_reasons.insert(reason.to_string());
    }
}

/// Extracts the signal map from an evidence set.
pub fn extract_signals(evidence: &[Evidence]) -> SignalMap {
    let mut signals = SignalMap::default();
    let mut failures_per_node: HashMap<String, u32> = HashMap::new();

    for ev in evidence {
        if ev.signal_strength >= 0.5 {
            signals.strong_evidence_ids.push(ev.id);
        }

        match &ev.data {
            EvidenceData::PodState {
                phase,
                node_name,
                restart_count,
                waiting_reason,
                terminated_reason,
                ready,
                ..
            } => {
                if let Some(reason) = waiting_reason {
                    signals.note_waiting_reason(reason);
                }
                if let Some(reason) = terminated_reason {
                    signals.terminated_reasons.insert(reason.clone());
                }
                signals.restart_count = signals.restart_count.max(*restart_count);
                let failing =
                    phase != "Running" || !ready || waiting_reason.is_some() || terminated_reason.is_some();
                if failing {
                    if let Some(node) = node_name {
                        *failures_per_node.entry(node.clone()).or_insert(0) += 1;
                    }
                }
            }
            EvidenceData::ContainerState {
                waiting_reason,
                terminated_reason,
                restart_count,
                ..
            } => {
                if let Some(reason) = waiting_reason {
                    signals.note_waiting_reason(reason);
                }
                if let Some(reason) = terminated_reason {
                    signals.terminated_reasons.insert(reason.clone());
                }
                signals.restart_count = signals.restart_count.max(*restart_count);
            }
            EvidenceData::DeployHistory {
                is_recent,
                image_changed,
                ..
            } => {
                if *is_recent {
                    signals.has_recent_deploy = true;
                }
                if *image_changed {
                    signals.image_changed = true;
                }
            }
            EvidenceData::LogsPattern {
                patterns,
                error_rate_per_minute,
                ..
            } => {
                signals.log_patterns.extend(patterns.iter().copied());
                signals.error_log_rate = signals.error_log_rate.max(*error_rate_per_minute);
            }
            EvidenceData::MetricSample { metric, value } => match metric {
                MetricKind::MemoryUsageRatio => {
                    signals.memory_usage_ratio = signals.memory_usage_ratio.max(*value);
                }
                MetricKind::P99Latency => {
                    signals.latency_p99 = signals.latency_p99.max(*value);
                }
                MetricKind::RestartCountDelta => {
                    signals.restart_count = signals.restart_count.max(*value as u32);
                }
                MetricKind::Http5xxRate => {
                    signals.http_5xx_rate = signals.http_5xx_rate.max(*value);
                }
                MetricKind::HpaUtilization => {
                    if *value >= 1.0 {
                        signals.hpa_at_max = true;
                    }
                }
                MetricKind::CpuThrottleRate => {}
            },
            EvidenceData::NodeState {
                ready,
                disk_pressure,
                memory_pressure,
                pid_pressure,
                pod_failures,
                ..
            } => {
                if !ready || *disk_pressure || *memory_pressure || *pid_pressure {
                    signals.node_unhealthy = true;
                }
                signals.pod_failures_on_node = signals.pod_failures_on_node.max(*pod_failures);
            }
            EvidenceData::HpaState { at_max, .. } => {
                if *at_max {
                    signals.hpa_at_max = true;
                }
            }
            EvidenceData::Events { records } => {
                signals.failed_events += records.len() as u32;
            }
        }
    }

    let max_node_failures = failures_per_node.values().copied().max().unwrap_or(0);
    signals.pod_failures_on_node = signals.pod_failures_on_node.max(max_node_failures);

    signals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{signal, EvidenceSource, TimeWindow};

    fn pod_evidence(
        waiting: Option<&str>,
        terminated: Option<&str>,
        restarts: u32,
        node: Option<&str>,
    ) -> Evidence {
        Evidence::new(
            Uuid::new_v4(),
            EvidenceSource::K8s,
            "api-7f",
            "payments",
            EvidenceData::PodState {
                name: "api-7f".to_string(),
                phase: "Running".to_string(),
                node_name: node.map(String::from),
                restart_count: restarts,
                waiting_reason: waiting.map(String::from),
                terminated_reason: terminated.map(String::from),
                ready: waiting.is_none() && terminated.is_none(),
            },
            signal::PRESENT,
            TimeWindow::last_minutes(15),
        )
    }

    fn metric_evidence(metric: MetricKind, value: f64) -> Evidence {
        Evidence::new(
            Uuid::new_v4(),
            EvidenceSource::Metrics,
            &metric.to_string(),
            "payments",
            EvidenceData::MetricSample { metric, value },
            signal::PRESENT,
            TimeWindow::last_minutes(15),
        )
    }

    #[test]
    fn test_pod_reasons_extracted() {
        let evidence = vec![
            pod_evidence(Some("CrashLoopBackOff"), None, 15, Some("node-1")),
            pod_evidence(None, Some("OOMKilled"), 3, Some("node-1")),
        ];
        let signals = extract_signals(&evidence);
        assert!(signals.waiting_reasons.contains("CrashLoopBackOff"));
        assert!(signals.terminated_reasons.contains("OOMKilled"));
        assert_eq!(signals.restart_count, 15);
        assert_eq!(signals.pod_failures_on_node, 2);
        assert!(!signals.image_pull_failed);
    }

    #[test]
    fn test_image_pull_flag() {
        let evidence = vec![pod_evidence(Some("ImagePullBackOff"), None, 0, None)];
        let signals = extract_signals(&evidence);
        assert!(signals.image_pull_failed);
    }

    #[test]
    fn test_metric_signals_take_max() {
        let evidence = vec![
            metric_evidence(MetricKind::MemoryUsageRatio, 0.72),
            metric_evidence(MetricKind::MemoryUsageRatio, 0.98),
            metric_evidence(MetricKind::P99Latency, 2.4),
            metric_evidence(MetricKind::HpaUtilization, 1.0),
        ];
        let signals = extract_signals(&evidence);
        assert_eq!(signals.memory_usage_ratio, 0.98);
        assert_eq!(signals.latency_p99, 2.4);
        assert!(signals.hpa_at_max);
    }

    #[test]
    fn test_extraction_order_independent() {
        let a = pod_evidence(Some("CrashLoopBackOff"), None, 15, Some("node-1"));
        let b = metric_evidence(MetricKind::MemoryUsageRatio, 0.98);
        let c = pod_evidence(None, Some("OOMKilled"), 2, Some("node-1"));

        let forward = extract_signals(&[a.clone(), b.clone(), c.clone()]);
        let reverse = extract_signals(&[c, b, a]);

        assert_eq!(forward.waiting_reasons, reverse.waiting_reasons);
        assert_eq!(forward.terminated_reasons, reverse.terminated_reasons);
        assert_eq!(forward.restart_count, reverse.restart_count);
        assert_eq!(forward.memory_usage_ratio, reverse.memory_usage_ratio);
        assert_eq!(forward.pod_failures_on_node, reverse.pod_failures_on_node);
    }

    #[test]
    fn test_weak_evidence_not_supporting() {
        let mut weak = pod_evidence(None, None, 0, None);
        weak.signal_strength = 0.2;
        let strong = pod_evidence(Some("CrashLoopBackOff"), None, 5, None);
        let signals = extract_signals(&[weak, strong.clone()]);
        assert_eq!(signals.strong_evidence_ids, vec![strong.id]);
    }
}
