//! # km-core
//!
//! Core data models, evidence graph store, and rules engine for Kube Medic.
//!
//! This crate holds everything the other crates agree on: the incident
//! lifecycle, evidence and hypothesis models, the remediation action model,
//! the typed evidence graph, the deterministic diagnosis rules, the
//! LLM-enrichment boundary, and configuration.

pub mod action;
pub mod config;
pub mod enrich;
pub mod evidence;
pub mod graph;
pub mod hypothesis;
pub mod incident;
pub mod rules;
pub mod signals;

pub use action::{
    idempotency_key, ActionParams, ActionStatus, ActionType, ExecutionResult, RemediationAction,
    RiskLevel, VerificationResult,
};
pub use config::{
    AppConfig, CollectionConfig, Environment, FreezeConfig, VerificationConfig,
};
pub use enrich::{apply_enrichment, EnrichError, EnrichedText, Enricher, MockEnricher};
pub use evidence::{
    signal, CollectorOutput, Evidence, EvidenceData, EvidenceSource, EvidenceType,
    EventRecord, LogPatternClass, MetricKind, TimeWindow,
};
pub use graph::{
    EntityDraft, EntityKey, EntityKind, GraphEdge, GraphEntity, GraphError, GraphStore,
    InMemoryGraphStore, RelationDraft, RelationType, Subgraph, MAX_SUBGRAPH_DEPTH,
};
pub use hypothesis::{GeneratedBy, Hypothesis, HypothesisCategory};
pub use incident::{
    derive_fingerprint, Alert, AlertSource, AuditAction, AuditEntry, FailureReason, Incident,
    IncidentStatus, Severity,
};
pub use rules::{
    builtin_rules, rank_hypotheses, score_confidence, DiagnosisRule, RuleThresholds, RulesEngine,
};
pub use signals::{extract_signals, SignalMap};
