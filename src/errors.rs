//! Typed error hierarchy for the conductor engine.
//!
//! Three top-level enums cover the three subsystems:
//! - `InvokeError` — a single stage-capability invocation
//! - `StoreError` — durable checkpoint/artifact/run storage
//! - `WorkflowError` — run-level coordinator failures
//!
//! Retryability is a property of the error, not of the call site: the
//! coordinator asks `is_retryable()` and applies the stage's retry policy;
//! nothing below the coordinator retries on its own.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from a single invocation of an external stage capability.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("stage '{stage}' timed out after {timeout_secs}s")]
    Timeout { stage: String, timeout_secs: u64 },

    #[error("stage '{stage}' capability failed: {message}")]
    Capability { stage: String, message: String },

    #[error("stage '{stage}' returned malformed output: expected {expected}, got {actual}")]
    OutputShape {
        stage: String,
        expected: String,
        actual: String,
    },
}

impl InvokeError {
    /// Whether the coordinator may retry this failure under the stage's
    /// retry budget. Schema mismatches are retryable only when the stage
    /// opts in (`retry_on_schema_mismatch`).
    pub fn is_retryable(&self, retry_on_schema_mismatch: bool) -> bool {
        match self {
            InvokeError::Timeout { .. } | InvokeError::Capability { .. } => true,
            InvokeError::OutputShape { .. } => retry_on_schema_mismatch,
        }
    }
}

/// Errors from the durable storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached or written. Retried on the
    /// long-backoff profile; the run stalls rather than fails until the
    /// outer budget is exhausted.
    #[error("storage unavailable at {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The checkpoint on disk does not parse. Never retried: the run is
    /// blocked until an operator explicitly discards the checkpoint.
    #[error("checkpoint for run {run_id} is corrupted at {path}: {message}")]
    CheckpointCorrupted {
        run_id: String,
        path: PathBuf,
        message: String,
    },

    #[error("failed to serialize {what}: {source}")]
    Serialize {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no record found for run {run_id}")]
    NotFound { run_id: String },
}

impl StoreError {
    /// Only plain unavailability is retryable; corruption and missing
    /// records are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }
}

/// Run-terminal errors surfaced by the coordinator.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("invalid transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: String,
        from: String,
        to: String,
    },

    #[error("stage '{stage}' exhausted its retry budget after {attempts} attempts: {last_error}")]
    StageExhausted {
        stage: String,
        attempts: u32,
        #[source]
        last_error: InvokeError,
    },

    #[error("run {run_id} is already executing; concurrent resume refused")]
    LockBusy { run_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_and_capability_are_retryable() {
        let timeout = InvokeError::Timeout {
            stage: "implement".into(),
            timeout_secs: 600,
        };
        let capability = InvokeError::Capability {
            stage: "implement".into(),
            message: "exit code 1".into(),
        };
        assert!(timeout.is_retryable(false));
        assert!(capability.is_retryable(false));
    }

    #[test]
    fn output_shape_retryability_is_configurable() {
        let err = InvokeError::OutputShape {
            stage: "write-tests".into(),
            expected: "non-empty test list".into(),
            actual: "empty list".into(),
        };
        assert!(!err.is_retryable(false));
        assert!(err.is_retryable(true));
    }

    #[test]
    fn output_shape_carries_expected_vs_actual() {
        let err = InvokeError::OutputShape {
            stage: "implement".into(),
            expected: "change_set reference".into(),
            actual: "null".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("change_set reference"));
        assert!(msg.contains("null"));
    }

    #[test]
    fn store_unavailable_is_retryable_corruption_is_not() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let unavailable = StoreError::Unavailable {
            path: PathBuf::from("/data/checkpoint.json"),
            source: io_err,
        };
        let corrupted = StoreError::CheckpointCorrupted {
            run_id: "r1".into(),
            path: PathBuf::from("/data/checkpoint.json"),
            message: "unexpected EOF".into(),
        };
        assert!(unavailable.is_retryable());
        assert!(!corrupted.is_retryable());
    }

    #[test]
    fn stage_exhausted_carries_attempt_count_and_source() {
        let err = WorkflowError::StageExhausted {
            stage: "plan".into(),
            attempts: 3,
            last_error: InvokeError::Timeout {
                stage: "plan".into(),
                timeout_secs: 60,
            },
        };
        assert!(err.to_string().contains("3 attempts"));
        match &err {
            WorkflowError::StageExhausted { last_error, .. } => {
                assert!(matches!(last_error, InvokeError::Timeout { .. }));
            }
            _ => panic!("expected StageExhausted"),
        }
    }

    #[test]
    fn workflow_error_converts_from_store_error() {
        let err: WorkflowError = StoreError::NotFound { run_id: "r9".into() }.into();
        assert!(matches!(
            err,
            WorkflowError::Store(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&InvokeError::Capability {
            stage: "x".into(),
            message: "y".into(),
        });
        assert_std_error(&StoreError::NotFound { run_id: "x".into() });
        assert_std_error(&WorkflowError::RunNotFound { run_id: "x".into() });
    }
}
