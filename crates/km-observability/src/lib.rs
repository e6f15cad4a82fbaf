//! # km-observability
//!
//! Structured logging setup and the bounded audit log for Kube Medic.

pub mod audit;
pub mod logging;

pub use audit::{AuditKind, AuditLog, AuditRecord};
pub use logging::{init_logging, init_logging_with_config, LoggingConfig};
