//! Post-remediation verifier.
//!
//! After the verification delay the workflow asks the verifier to compare
//! pre/post metrics and pod readiness. Results are advisory: a negative
//! verification marks the action unverified, and the workflow decides what
//! to do with its retry budget.

use km_connectors::{ClusterConnector, MetricSelector, MetricsConnector};
use km_core::{MetricKind, VerificationConfig, VerificationResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Metrics captured before execution, compared against after.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationBaseline {
    pub error_rate: Option<f64>,
    pub latency_p99: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

pub struct Verifier {
    cluster: Arc<dyn ClusterConnector>,
    metrics: Arc<dyn MetricsConnector>,
    config: VerificationConfig,
}

impl Verifier {
    pub fn new(
        cluster: Arc<dyn ClusterConnector>,
        metrics: Arc<dyn MetricsConnector>,
        config: VerificationConfig,
    ) -> Self {
        Self {
            cluster,
            metrics,
            config,
        }
    }

    /// Snapshots the error rate and latency before execution. Backend
    /// failures leave the corresponding field empty rather than failing.
    pub async fn capture_baseline(&self, selector: &MetricSelector) -> VerificationBaseline {
        let error_rate = self
            .metrics
            .instant(MetricKind::Http5xxRate, selector)
            .await
            .ok()
            .flatten();
        let latency_p99 = self
            .metrics
            .instant(MetricKind::P99Latency, selector)
            .await
            .ok()
            .flatten();
        VerificationBaseline {
            error_rate,
            latency_p99,
            captured_at: Utc::now(),
        }
    }

    /// Re-queries metrics and pod state and judges recovery.
    ///
    /// `success = error rate recovered AND no new restarts AND >= 90% of
    /// pods ready` (thresholds from config).
    #[instrument(skip(self, baseline), fields(incident_id = %incident_id))]
    pub async fn verify(
        &self,
        incident_id: Uuid,
        action_id: Uuid,
        namespace: &str,
        service: Option<&str>,
        baseline: &VerificationBaseline,
    ) -> VerificationResult {
        let selector = MetricSelector {
            namespace: namespace.to_string(),
            service: service.map(String::from),
        };

        let error_rate_after = self
            .metrics
            .instant(MetricKind::Http5xxRate, &selector)
            .await
            .ok()
            .flatten();
        let latency_after = self
            .metrics
            .instant(MetricKind::P99Latency, &selector)
            .await
            .ok()
            .flatten();
        let restart_delta = self
            .metrics
            .instant(MetricKind::RestartCountDelta, &selector)
            .await
            .ok()
            .flatten()
            .unwrap_or(0.0);

        let pods_ready_ratio = self.pods_ready_ratio(namespace, service).await;

        let after = error_rate_after.unwrap_or(0.0);
        let error_ok = match baseline.error_rate {
            Some(before) => {
                after < before * self.config.error_improvement_ratio
                    || after < self.config.error_rate_floor
            }
            None => after < self.config.error_rate_floor,
        };
        let restarts_ok = restart_delta == 0.0;
        let pods_ok = pods_ready_ratio >= self.config.ready_ratio_min;
        let success = error_ok && restarts_ok && pods_ok;

        debug!(
            error_ok,
            restarts_ok, pods_ok, pods_ready_ratio, "verification checks evaluated"
        );
        info!(success, "verification complete");

        VerificationResult {
            id: Uuid::new_v4(),
            action_id,
            incident_id,
            success,
            metrics_improved: error_ok,
            error_rate_before: baseline.error_rate,
            error_rate_after,
            latency_before: baseline.latency_p99,
            latency_after,
            restart_count_delta_post: restart_delta,
            pods_ready_ratio,
            verification_details: serde_json::json!({
                "error_ok": error_ok,
                "restarts_ok": restarts_ok,
                "pods_ok": pods_ok,
            }),
            verified_at: Utc::now(),
        }
    }

    async fn pods_ready_ratio(&self, namespace: &str, service: Option<&str>) -> f64 {
        let selector = service.map(|s| format!("app={}", s));
        match self.cluster.list_pods(namespace, selector.as_deref()).await {
            Ok(pods) if !pods.is_empty() => {
                let ready = pods.iter().filter(|p| p.is_healthy()).count();
                ready as f64 / pods.len() as f64
            }
            _ => 0.0,
        }
    }
}
