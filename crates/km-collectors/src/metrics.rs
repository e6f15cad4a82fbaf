//! Metrics collector.
//!
//! Evaluates the fixed query family against the metrics backend and emits
//! one metric-sample evidence per query that returned a series.

use crate::registry::{Collector, IncidentContext};
use async_trait::async_trait;
use km_connectors::{MetricSelector, MetricsConnector};
use km_core::{
    signal, CollectorOutput, Evidence, EvidenceData, EvidenceSource, MetricKind, TimeWindow,
};
use std::sync::Arc;

/// Every query the collector evaluates, in a fixed order.
const QUERY_FAMILY: &[MetricKind] = &[
    MetricKind::RestartCountDelta,
    MetricKind::MemoryUsageRatio,
    MetricKind::CpuThrottleRate,
    MetricKind::Http5xxRate,
    MetricKind::P99Latency,
    MetricKind::HpaUtilization,
];

fn signal_strength(metric: MetricKind, value: f64) -> f64 {
    match metric {
        MetricKind::RestartCountDelta => {
            if value > 5.0 {
                signal::HIGH_RESTARTS
            } else if value > 0.0 {
                signal::PRESENT
            } else {
                signal::INFORMATIONAL
            }
        }
        MetricKind::MemoryUsageRatio => {
            if value >= 0.95 {
                signal::TERMINAL
            } else if value >= 0.8 {
                signal::HIGH_RESTARTS
            } else if value >= 0.7 {
                signal::PRESENT
            } else {
                signal::INFORMATIONAL
            }
        }
        MetricKind::CpuThrottleRate => {
            if value > 0.5 {
                signal::HIGH_RESTARTS
            } else if value > 0.1 {
                signal::PRESENT
            } else {
                signal::INFORMATIONAL
            }
        }
        MetricKind::Http5xxRate => {
            if value > 0.1 {
                signal::HIGH_RESTARTS
            } else if value > 0.01 {
                signal::PRESENT
            } else {
                signal::INFORMATIONAL
            }
        }
        MetricKind::P99Latency => {
            if value > 2.0 {
                signal::HIGH_RESTARTS
            } else if value > 1.0 {
                signal::PRESENT
            } else {
                signal::INFORMATIONAL
            }
        }
        MetricKind::HpaUtilization => {
            if value >= 1.0 {
                signal::HIGH_RESTARTS
            } else {
                signal::INFORMATIONAL
            }
        }
    }
}

pub struct MetricsCollector {
    metrics: Arc<dyn MetricsConnector>,
}

impl MetricsCollector {
    pub fn new(metrics: Arc<dyn MetricsConnector>) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl Collector for MetricsCollector {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn collect(&self, ctx: &IncidentContext, window: TimeWindow) -> CollectorOutput {
        let mut out = CollectorOutput::new(self.name());
        let selector = MetricSelector {
            namespace: ctx.namespace.clone(),
            service: ctx.service.clone(),
        };

        for &metric in QUERY_FAMILY {
            match self.metrics.instant(metric, &selector).await {
                Ok(Some(value)) => {
                    let strength = signal_strength(metric, value);
                    out.evidence.push(
                        Evidence::new(
                            ctx.incident_id,
                            EvidenceSource::Metrics,
                            &metric.to_string(),
                            &ctx.namespace,
                            EvidenceData::MetricSample { metric, value },
                            strength,
                            window,
                        )
                        .with_summary(format!("{} = {:.3}", metric, value)),
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    out.errors.push(format!("{}: {}", metric, e));
                    out.partial = true;
                }
            }
        }
        out
    }
}
