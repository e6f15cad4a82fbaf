//! Deploy-diff collector.
//!
//! Fetches rollout history for the affected workload, flags revisions inside
//! the deploy lookback, and diffs image tags and config hashes between the
//! current and prior ReplicaSet.

use crate::registry::{Collector, IncidentContext};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use km_connectors::{ClusterConnector, ReplicaSetInfo};
use km_core::{
    signal, CollectorOutput, Evidence, EvidenceData, EvidenceSource, TimeWindow,
};
use std::collections::HashMap;
use std::sync::Arc;

pub struct DeployDiffCollector {
    cluster: Arc<dyn ClusterConnector>,
}

impl DeployDiffCollector {
    pub fn new(cluster: Arc<dyn ClusterConnector>) -> Self {
        Self { cluster }
    }

    fn diff_revisions(
        ctx: &IncidentContext,
        window: TimeWindow,
        deployment: &str,
        mut revisions: Vec<ReplicaSetInfo>,
    ) -> Option<Evidence> {
        if revisions.is_empty() {
            return None;
        }
        revisions.sort_by_key(|r| std::cmp::Reverse(r.revision));
        let current = &revisions[0];
        let previous = revisions.get(1);

        let lookback = Duration::minutes(ctx.deploy_lookback_minutes);
        let is_recent = Utc::now() - current.created_at <= lookback;
        let image_changed = previous
            .map(|p| p.images != current.images)
            .unwrap_or(false);
        let config_hash_changed = previous
            .map(|p| p.config_hash != current.config_hash)
            .unwrap_or(false);

        let strength = if is_recent {
            signal::DEPLOY_CORRELATED
        } else if image_changed || config_hash_changed {
            signal::PRESENT
        } else {
            signal::INFORMATIONAL
        };

        let mut summary = format!("Deployment {}: revision {}", deployment, current.revision);
        if is_recent {
            let age = (Utc::now() - current.created_at).num_minutes();
            summary.push_str(&format!(" (deployed {}m ago)", age));
        }
        if image_changed {
            summary.push_str(", image changed");
        }

        Some(
            Evidence::new(
                ctx.incident_id,
                EvidenceSource::Deploy,
                deployment,
                &ctx.namespace,
                EvidenceData::DeployHistory {
                    deployment: deployment.to_string(),
                    current_revision: current.revision,
                    previous_revision: previous.map(|p| p.revision),
                    current_images: current.images.clone(),
                    previous_images: previous.map(|p| p.images.clone()).unwrap_or_default(),
                    image_changed,
                    config_hash_changed,
                    deployed_at: Some(current.created_at),
                    is_recent,
                },
                strength,
                window,
            )
            .with_summary(summary),
        )
    }
}

#[async_trait]
impl Collector for DeployDiffCollector {
    fn name(&self) -> &str {
        "deploy_diff"
    }

    async fn collect(&self, ctx: &IncidentContext, window: TimeWindow) -> CollectorOutput {
        let mut out = CollectorOutput::new(self.name());

        let replicasets = match self.cluster.list_replicasets(&ctx.namespace).await {
            Ok(rs) => rs,
            Err(e) => {
                out.errors.push(format!("replicasets: {}", e));
                out.partial = true;
                return out;
            }
        };

        let mut by_deployment: HashMap<String, Vec<ReplicaSetInfo>> = HashMap::new();
        for rs in replicasets {
            if let Some(service) = &ctx.service {
                if !rs.deployment.contains(service.as_str()) {
                    continue;
                }
            }
            by_deployment.entry(rs.deployment.clone()).or_default().push(rs);
        }

        let mut deployments: Vec<_> = by_deployment.into_iter().collect();
        deployments.sort_by(|a, b| a.0.cmp(&b.0));
        for (deployment, revisions) in deployments {
            if let Some(ev) = Self::diff_revisions(ctx, window, &deployment, revisions) {
                out.evidence.push(ev);
            }
        }
        out
    }
}
