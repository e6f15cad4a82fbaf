//! # km-policy
//!
//! Blast radius scoring, the pure remediation policy gate, and the approval
//! channel contract for Kube Medic. The gate is the single authority on
//! per-environment action allowlists.

pub mod approval;
pub mod blast;
pub mod gate;

pub use approval::{ActionSummary, ApprovalChannel, ApprovalOutcome, MockApprovalChannel};
pub use blast::{compute as compute_blast_radius, BlastRadiusAssessment, BlastRadiusInput, BlastWeights};
pub use gate::{evaluate, PolicyConfig, PolicyDecision, PolicyEvaluation, PolicyInput};
