//! LLM-enrichment boundary.
//!
//! Enrichment may refine a hypothesis' prose but must never alter rank,
//! confidence, category, evidence links, or recommended actions. The caller
//! copies only the prose fields back, so a misbehaving enricher cannot leak
//! changes. A failing enricher degrades to the rules-only hypothesis.

use crate::hypothesis::{GeneratedBy, Hypothesis};
use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

/// Errors from an enrichment provider.
#[derive(Error, Debug)]
pub enum EnrichError {
    #[error("Enrichment provider unavailable: {0}")]
    Unavailable(String),

    #[error("Enrichment provider error: {0}")]
    Provider(String),
}

/// Rewritten prose for one hypothesis.
#[derive(Debug, Clone)]
pub struct EnrichedText {
    pub title: String,
    pub description: String,
}

/// A provider that can rewrite hypothesis prose.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, hypothesis: &Hypothesis) -> Result<EnrichedText, EnrichError>;
}

/// Applies enrichment to a hypothesis behind the pure boundary.
///
/// Only `title`, `description`, and `generated_by` can change; everything
/// else is carried over from the input verbatim.
pub async fn apply_enrichment(enricher: &dyn Enricher, hypothesis: Hypothesis) -> Hypothesis {
    match enricher.enrich(&hypothesis).await {
        Ok(text) => {
            let mut out = hypothesis;
            out.title = text.title;
            out.description = text.description;
            out.generated_by = GeneratedBy::RulesLlm;
            out
        }
        Err(e) => {
            warn!(error = %e, "enrichment failed, keeping rules-only hypothesis");
            hypothesis
        }
    }
}

/// Mock enricher for tests and for running without an LLM configured.
pub struct MockEnricher {
    pub fail: bool,
}

impl MockEnricher {
    pub fn new() -> Self {
        Self { fail: false }
    }

    pub fn failing() -> Self {
        Self { fail: true }
    }
}

impl Default for MockEnricher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Enricher for MockEnricher {
    async fn enrich(&self, hypothesis: &Hypothesis) -> Result<EnrichedText, EnrichError> {
        if self.fail {
            return Err(EnrichError::Unavailable("mock enricher down".to_string()));
        }
        Ok(EnrichedText {
            title: format!("{} (summarized)", hypothesis.title),
            description: format!(
                "{} Operators should review the linked evidence before acting.",
                hypothesis.description
            ),
        })
    }
}
