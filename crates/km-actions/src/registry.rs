//! Action trait and execution registry.
//!
//! The registry owns the safety machinery around cluster mutations:
//! idempotency-key replay (a re-issued action returns the cached record
//! without touching the cluster), a logical lease per
//! `(namespace, target_resource)` so no two actions race on one target, and
//! bounded retries with exponential backoff for transient upstream errors.

use async_trait::async_trait;
use km_connectors::ConnectorError;
use km_core::{ActionType, ExecutionResult, RemediationAction};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

/// Errors that can occur during action execution.
#[derive(Error, Debug, Clone)]
pub enum ActionError {
    #[error("No action registered for type: {0}")]
    NotRegistered(ActionType),

    #[error("Target not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Target busy: {0}")]
    TargetBusy(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Deadline exceeded after {0} attempts")]
    Timeout(u32),
}

impl ActionError {
    /// Only transient upstream failures are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ActionError::Transient(_))
    }

    /// Short tag recorded in execution details.
    pub fn kind(&self) -> &'static str {
        match self {
            ActionError::NotRegistered(_) => "not_registered",
            ActionError::NotFound(_) => "not_found",
            ActionError::Forbidden(_) => "forbidden",
            ActionError::InvalidParameters(_) => "invalid_parameters",
            ActionError::TargetBusy(_) => "target_busy",
            ActionError::Transient(_) => "transient",
            ActionError::Timeout(_) => "timeout",
        }
    }
}

impl From<ConnectorError> for ActionError {
    fn from(e: ConnectorError) -> Self {
        match e {
            ConnectorError::NotFound(msg) => ActionError::NotFound(msg),
            ConnectorError::Forbidden(msg) => ActionError::Forbidden(msg),
            ConnectorError::InvalidRequest(msg) => ActionError::InvalidParameters(msg),
            ConnectorError::RequestFailed(msg)
            | ConnectorError::Unavailable(msg)
            | ConnectorError::Timeout(msg) => ActionError::Transient(msg),
        }
    }
}

/// Everything an action needs to run.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub action: RemediationAction,
    /// The incident's service selector, for pod discovery.
    pub service: Option<String>,
}

/// One executable remediation.
#[async_trait]
pub trait Action: Send + Sync {
    fn action_type(&self) -> ActionType;

    /// Checks the request carries the right parameter variant.
    fn validate(&self, request: &ActionRequest) -> Result<(), ActionError>;

    /// Performs the mutation. Must be expressed so that repeating it
    /// produces the same observable cluster state.
    async fn execute(&self, request: &ActionRequest) -> Result<serde_json::Value, ActionError>;
}

/// Retry and deadline settings for the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub max_attempts: u32,
    /// Backoff before attempt 2, 3, ... (seconds).
    pub backoff_secs: Vec<u64>,
    pub attempt_timeout_secs: u64,
    pub overall_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_secs: vec![1, 4, 16],
            attempt_timeout_secs: 60,
            overall_timeout_secs: 300,
        }
    }
}

impl ExecutorConfig {
    /// Millisecond-scale settings for tests.
    pub fn fast() -> Self {
        Self {
            max_attempts: 3,
            backoff_secs: vec![0, 0, 0],
            attempt_timeout_secs: 2,
            overall_timeout_secs: 5,
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let secs = self
            .backoff_secs
            .get(attempt as usize)
            .or_else(|| self.backoff_secs.last())
            .copied()
            .unwrap_or(1);
        let jitter = 1.0 + jitter_fraction() * 0.25;
        Duration::from_millis((secs as f64 * 1000.0 * jitter) as u64)
    }
}

/// Pseudo-random jitter fraction in [0, 1).
fn jitter_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

/// A cached terminal execution outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExecutionRecord {
    idempotency_key: String,
    result: ExecutionResult,
}

/// Registry of actions keyed by type, with replay cache and target leases.
pub struct ActionRegistry {
    actions: HashMap<ActionType, Arc<dyn Action>>,
    records: RwLock<HashMap<String, ExecutionRecord>>,
    leases: Mutex<HashSet<(String, String)>>,
    config: ExecutorConfig,
}

impl ActionRegistry {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            actions: HashMap::new(),
            records: RwLock::new(HashMap::new()),
            leases: Mutex::new(HashSet::new()),
            config,
        }
    }

    pub fn register(&mut self, action: Arc<dyn Action>) {
        let action_type = action.action_type();
        info!(action = %action_type, "registering action");
        self.actions.insert(action_type, action);
    }

    pub fn registered_types(&self) -> Vec<ActionType> {
        let mut types: Vec<_> = self.actions.keys().copied().collect();
        types.sort();
        types
    }

    /// Executes the requested action with idempotency, leasing, and retries.
    ///
    /// Terminal outcomes, success or failure, are cached by idempotency key;
    /// a re-issued request returns the cached record with no cluster call.
    /// Pre-flight problems (unknown type, bad parameters, busy target) are
    /// surfaced as errors and not cached.
    #[instrument(skip(self, request), fields(action = %request.action.action_type, target = %request.action.target_resource))]
    pub async fn execute(&self, request: &ActionRequest) -> Result<ExecutionResult, ActionError> {
        let key = request.action.idempotency_key.clone();
        if let Some(record) = self.records.read().await.get(&key) {
            debug!(idempotency_key = %key, "replaying cached execution result");
            return Ok(record.result.clone());
        }

        let action = self
            .actions
            .get(&request.action.action_type)
            .cloned()
            .ok_or(ActionError::NotRegistered(request.action.action_type))?;
        action.validate(request)?;

        let lease_key = (
            request.action.target_namespace.clone(),
            request.action.target_resource.clone(),
        );
        {
            let mut leases = self.leases.lock().await;
            if !leases.insert(lease_key.clone()) {
                return Err(ActionError::TargetBusy(format!(
                    "{}/{} has an action in flight",
                    lease_key.0, lease_key.1
                )));
            }
        }

        let started = std::time::Instant::now();
        let outcome = self.execute_with_retries(action.as_ref(), request).await;
        self.leases.lock().await.remove(&lease_key);

        let result = match outcome {
            Ok((details, attempts)) => ExecutionResult {
                success: true,
                message: format!("{} completed", request.action.action_type),
                details,
                attempts,
                duration_ms: started.elapsed().as_millis() as u64,
            },
            Err((error, attempts)) => {
                warn!(error = %error, attempts, "action execution failed");
                ExecutionResult {
                    success: false,
                    message: error.to_string(),
                    details: serde_json::json!({ "error_kind": error.kind() }),
                    attempts,
                    duration_ms: started.elapsed().as_millis() as u64,
                }
            }
        };

        self.records.write().await.insert(
            key.clone(),
            ExecutionRecord {
                idempotency_key: key,
                result: result.clone(),
            },
        );
        Ok(result)
    }

    async fn execute_with_retries(
        &self,
        action: &dyn Action,
        request: &ActionRequest,
    ) -> Result<(serde_json::Value, u32), (ActionError, u32)> {
        let overall_deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.overall_timeout_secs);
        let attempt_timeout = Duration::from_secs(self.config.attempt_timeout_secs);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let attempt_result =
                match tokio::time::timeout(attempt_timeout, action.execute(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(ActionError::Transient("attempt deadline exceeded".into())),
                };

            match attempt_result {
                Ok(details) => {
                    if attempts > 1 {
                        debug!(attempts, "action succeeded after retry");
                    }
                    return Ok((details, attempts));
                }
                Err(e) if !e.is_retryable() => return Err((e, attempts)),
                Err(e) => {
                    if attempts >= self.config.max_attempts {
                        return Err((e, attempts));
                    }
                    let backoff = self.config.backoff_for(attempts - 1);
                    if tokio::time::Instant::now() + backoff >= overall_deadline {
                        return Err((ActionError::Timeout(attempts), attempts));
                    }
                    warn!(
                        attempt = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Number of cached terminal outcomes, for tests and stats.
    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }
}
