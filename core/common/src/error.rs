//! Error types for Outbox.
//!
//! Errors are split by the component that raises them: persistence
//! (`StoreError`), remote execution (`ExecError`) and the sync engine's
//! refusal to start a pass (`EngineError`).

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the action store and the key-value boundary beneath it.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying storage I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The persisted queue could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The action was refused at enqueue time.
    #[error("Invalid action: {0}")]
    InvalidAction(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Errors raised while turning a pending action into a remote effect.
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    /// Transport failure. The action should be retried later.
    #[error("Network error: {0}")]
    Network(String),

    /// The remote side refused the mutation (validation, conflict, ...).
    #[error("Rejected by remote: {0}")]
    Rejected(String),

    /// The action did not complete within its time budget.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl ExecError {
    /// Whether this failure is transient.
    ///
    /// Timeouts count as transport failures.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecError::Network(_) | ExecError::Timeout(_))
    }
}

/// Reasons a sync pass did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Another pass is already draining the queue.
    #[error("A sync pass is already running")]
    AlreadySyncing,

    /// The connectivity gate does not report the network as reachable.
    #[error("Network is not available")]
    Offline,

    /// The scheduler task that runs passes has stopped.
    #[error("Sync scheduler is not running")]
    SchedulerStopped,
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for executor operations.
pub type ExecResult<T> = std::result::Result<T, ExecError>;
