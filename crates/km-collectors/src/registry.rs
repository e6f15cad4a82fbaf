//! Collector capability trait and registry.
//!
//! Collectors are polymorphic over `{collect}` and registered by source
//! name, so new sources plug in without touching the rules engine or the
//! workflow. The registry runs all collectors in parallel, joins on a
//! barrier, and enforces both the per-source deadline and the overall
//! collection budget.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use km_core::{CollectorOutput, Incident, TimeWindow};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Everything a collector needs to know about the incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentContext {
    pub incident_id: Uuid,
    pub cluster: String,
    pub namespace: String,
    pub service: Option<String>,
    pub started_at: DateTime<Utc>,
    /// How far back a rollout counts as recent (minutes).
    pub deploy_lookback_minutes: i64,
}

impl IncidentContext {
    pub fn from_incident(incident: &Incident, deploy_lookback_minutes: i64) -> Self {
        Self {
            incident_id: incident.id,
            cluster: incident.cluster.clone(),
            namespace: incident.namespace.clone(),
            service: incident.service.clone(),
            started_at: incident.started_at,
            deploy_lookback_minutes,
        }
    }

    /// Label selector for the incident's service, when known.
    pub fn selector(&self) -> Option<String> {
        self.service.as_ref().map(|s| format!("app={}", s))
    }
}

/// A source of evidence.
///
/// Collectors swallow their own errors: a failing backend produces a partial
/// output with the error recorded, never a workflow failure.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Registry name of this collector.
    fn name(&self) -> &str;

    async fn collect(&self, ctx: &IncidentContext, window: TimeWindow) -> CollectorOutput;
}

/// Registry of collectors keyed by source name.
pub struct CollectorRegistry {
    collectors: HashMap<String, Arc<dyn Collector>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self {
            collectors: HashMap::new(),
        }
    }

    pub fn register(&mut self, collector: Arc<dyn Collector>) {
        let name = collector.name().to_string();
        info!(collector = %name, "registering collector");
        self.collectors.insert(name, collector);
    }

    pub fn names(&self) -> Vec<&str> {
        self.collectors.keys().map(|s| s.as_str()).collect()
    }

    /// Runs every collector in parallel and joins on a barrier.
    ///
    /// The join resolves when all collectors finish, any hit the per-source
    /// deadline (their output is flagged partial), or the overall budget
    /// elapses, whichever comes first. Collectors cut off by the budget are
    /// reported as timed out.
    #[instrument(skip(self, ctx), fields(incident_id = %ctx.incident_id))]
    pub async fn collect_all(
        &self,
        ctx: &IncidentContext,
        window: TimeWindow,
        per_source_deadline: Duration,
        total_budget: Duration,
    ) -> Vec<CollectorOutput> {
        let mut pending: HashSet<String> = self.collectors.keys().cloned().collect();
        let mut set = JoinSet::new();
        for (name, collector) in &self.collectors {
            let collector = Arc::clone(collector);
            let ctx = ctx.clone();
            let name = name.clone();
            set.spawn(async move {
                match tokio::time::timeout(per_source_deadline, collector.collect(&ctx, window))
                    .await
                {
                    Ok(output) => output,
                    Err(_) => {
                        warn!(collector = %name, "collector hit per-source deadline");
                        CollectorOutput::timed_out(&name)
                    }
                }
            });
        }

        let deadline = tokio::time::Instant::now() + total_budget;
        let mut outputs = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok(output))) => {
                    pending.remove(&output.collector);
                    outputs.push(output);
                }
                Ok(Some(Err(join_err))) => {
                    warn!(error = %join_err, "collector task failed");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        remaining = pending.len(),
                        "overall collection budget elapsed"
                    );
                    set.abort_all();
                    break;
                }
            }
        }
        for name in pending {
            outputs.push(CollectorOutput::timed_out(&name));
        }

        let evidence_total: usize = outputs.iter().map(|o| o.evidence.len()).sum();
        info!(
            collectors = outputs.len(),
            evidence = evidence_total,
            "evidence collection joined"
        );
        outputs
    }
}

impl Default for CollectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use km_core::{signal, Evidence, EvidenceData, EvidenceSource, MetricKind};

    fn test_ctx() -> IncidentContext {
        IncidentContext {
            incident_id: Uuid::new_v4(),
            cluster: "test-cluster".to_string(),
            namespace: "payments".to_string(),
            service: Some("api".to_string()),
            started_at: Utc::now(),
            deploy_lookback_minutes: 30,
        }
    }

    struct FixedCollector {
        name: String,
        delay: Duration,
    }

    #[async_trait]
    impl Collector for FixedCollector {
        fn name(&self) -> &str {
            &self.name
        }

        async fn collect(&self, ctx: &IncidentContext, window: TimeWindow) -> CollectorOutput {
            tokio::time::sleep(self.delay).await;
            let mut out = CollectorOutput::new(&self.name);
            out.evidence.push(Evidence::new(
                ctx.incident_id,
                EvidenceSource::Metrics,
                "m",
                &ctx.namespace,
                EvidenceData::MetricSample {
                    metric: MetricKind::Http5xxRate,
                    value: 0.0,
                },
                signal::INFORMATIONAL,
                window,
            ));
            out
        }
    }

    #[tokio::test]
    async fn test_all_collectors_join() {
        let mut registry = CollectorRegistry::new();
        registry.register(Arc::new(FixedCollector {
            name: "a".to_string(),
            delay: Duration::from_millis(5),
        }));
        registry.register(Arc::new(FixedCollector {
            name: "b".to_string(),
            delay: Duration::from_millis(10),
        }));

        let outputs = registry
            .collect_all(
                &test_ctx(),
                TimeWindow::last_minutes(15),
                Duration::from_secs(1),
                Duration::from_secs(2),
            )
            .await;
        assert_eq!(outputs.len(), 2);
        assert!(outputs.iter().all(|o| !o.partial));
    }

    #[tokio::test]
    async fn test_slow_collector_flagged_partial() {
        let mut registry = CollectorRegistry::new();
        registry.register(Arc::new(FixedCollector {
            name: "fast".to_string(),
            delay: Duration::from_millis(5),
        }));
        registry.register(Arc::new(FixedCollector {
            name: "slow".to_string(),
            delay: Duration::from_secs(10),
        }));

        let outputs = registry
            .collect_all(
                &test_ctx(),
                TimeWindow::last_minutes(15),
                Duration::from_millis(50),
                Duration::from_secs(2),
            )
            .await;
        assert_eq!(outputs.len(), 2);
        let slow = outputs.iter().find(|o| o.collector == "slow").unwrap();
        assert!(slow.partial);
        assert!(slow.evidence.is_empty());
        let fast = outputs.iter().find(|o| o.collector == "fast").unwrap();
        assert!(!fast.partial);
        assert_eq!(fast.evidence.len(), 1);
    }

    #[tokio::test]
    async fn test_overall_budget_cuts_off_stragglers() {
        let mut registry = CollectorRegistry::new();
        registry.register(Arc::new(FixedCollector {
            name: "straggler".to_string(),
            delay: Duration::from_secs(30),
        }));

        let outputs = registry
            .collect_all(
                &test_ctx(),
                TimeWindow::last_minutes(15),
                Duration::from_secs(60),
                Duration::from_millis(20),
            )
            .await;
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].partial);
    }
}
