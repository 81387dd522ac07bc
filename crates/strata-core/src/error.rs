//! Unified error types for Strata

use thiserror::Error;

use crate::types::Level;

/// Unified error type for all Strata operations
#[derive(Error, Debug)]
pub enum StrataError {
    // Scheduling errors
    /// Retryable: acquisition could not be satisfied within the timeout,
    /// or the request exceeds the level's configured capacity outright.
    #[error("Capacity exceeded at {level}: requested {requested}, capacity {capacity}")]
    CapacityExceeded {
        level: Level,
        requested: usize,
        capacity: usize,
    },

    // Execution errors
    #[error("Slice {slice_id} failed at {level}: {reason}")]
    SliceExecutionFailed {
        slice_id: String,
        level: Level,
        reason: String,
    },

    /// Fatal: a Saga rollback step itself failed. Automatic recovery is no
    /// longer possible; the full chain of attempted compensations is carried.
    #[error("Compensation failed after steps {attempted:?}: {reason}")]
    CompensationFailed {
        attempted: Vec<usize>,
        reason: String,
    },

    // Persistence errors
    /// Fatal for the current operation: the run must not advance state
    /// without a durable checkpoint.
    #[error("Checkpoint write failed for run {run_id}: {reason}")]
    CheckpointWriteFailed { run_id: String, reason: String },

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("State store error: {0}")]
    Store(String),

    // Decomposition errors
    #[error("Decomposition failed: {0}")]
    Decomposition(String),

    // Orchestrator errors
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Run {0} was cancelled")]
    Cancelled(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl StrataError {
    /// Whether the caller may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
}

/// Result type alias using StrataError
pub type Result<T> = std::result::Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_exceeded_is_retryable() {
        let err = StrataError::CapacityExceeded {
            level: Level::Tertiary,
            requested: 40,
            capacity: 30,
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("tertiary"));
    }

    #[test]
    fn test_checkpoint_write_failed_is_not_retryable() {
        let err = StrataError::CheckpointWriteFailed {
            run_id: "run-1".to_string(),
            reason: "disk full".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_compensation_failed_carries_chain() {
        let err = StrataError::CompensationFailed {
            attempted: vec![2, 1],
            reason: "step 1 compensation rejected".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("[2, 1]"));
    }
}
