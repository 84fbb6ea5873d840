//! Typed error hierarchy for the conductor engine.
//!
//! One enum per subsystem, ordered by blast radius:
//! - `AgentCallError` — a single agent call; absorbed by the executor's retry policy
//! - `RoundError` — a whole fan-out round; fails the phase
//! - `StoreError` — artifact/checkpoint persistence; checkpoint writes are fatal
//! - `ConflictError` — classification failures; force human escalation
//! - `FeedbackError` — GitHub feedback loop failures
//! - `EngineError` — top-level, everything converts into it

use std::time::Duration;
use thiserror::Error;

/// Errors from one call to the external agent backend.
#[derive(Debug, Error)]
pub enum AgentCallError {
    /// The backend could not be reached. Not retried locally; the round
    /// coordinator records the persona as missing.
    #[error("agent backend unavailable: {0}")]
    Unavailable(String),

    /// No response arrived within the configured call timeout.
    #[error("agent call timed out after {timeout:?}")]
    Timeout { timeout: Duration },
}

impl AgentCallError {
    /// Only timeouts are retried inside the executor.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors from a fan-out/fan-in round.
#[derive(Debug, Error)]
pub enum RoundError {
    #[error("all {personas} agents failed to produce output for the round")]
    AllAgentsFailed { personas: usize },
}

/// Errors from the storage layer (artifact store, checkpoint store, run store).
#[derive(Debug, Error)]
pub enum StoreError {
    /// A checkpoint could not be made durable. The in-flight transition is
    /// aborted and the previous checkpoint remains current.
    #[error("failed to write checkpoint {seq} for run {run_id}: {message}")]
    CheckpointWrite {
        run_id: String,
        seq: u64,
        message: String,
    },

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("backend I/O at {key}: {source}")]
    Backend {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt record at {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from conflict detection.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// A disagreement that cannot be placed in the taxonomy. Callers must
    /// treat this as severity high and escalate, never auto-resolve.
    #[error("conflict on '{question}' could not be classified")]
    Taxonomy { question: String },
}

/// Errors from the GitHub feedback loop.
#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error("GitHub call failed: {0}")]
    Github(String),
}

/// Top-level engine errors surfaced to operators.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("run {0} not found")]
    RunNotFound(String),

    #[error("run {run_id} has no checkpoint to resume from")]
    NoCheckpoint { run_id: String },

    #[error("run {run_id} is {status} and cannot be driven")]
    NotRunnable { run_id: String, status: String },

    #[error(transparent)]
    Round(#[from] RoundError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Feedback(#[from] FeedbackError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_timeout_is_retryable() {
        let err = AgentCallError::Timeout {
            timeout: Duration::from_secs(30),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("30"));
    }

    #[test]
    fn agent_unavailable_is_not_retryable() {
        let err = AgentCallError::Unavailable("connection refused".to_string());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn checkpoint_write_error_carries_run_and_seq() {
        let err = StoreError::CheckpointWrite {
            run_id: "r-1".to_string(),
            seq: 4,
            message: "disk full".to_string(),
        };
        match &err {
            StoreError::CheckpointWrite { run_id, seq, .. } => {
                assert_eq!(run_id, "r-1");
                assert_eq!(*seq, 4);
            }
            _ => panic!("Expected CheckpointWrite variant"),
        }
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn engine_error_converts_from_round_error() {
        let inner = RoundError::AllAgentsFailed { personas: 3 };
        let err: EngineError = inner.into();
        assert!(matches!(
            err,
            EngineError::Round(RoundError::AllAgentsFailed { personas: 3 })
        ));
    }

    #[test]
    fn engine_error_converts_from_store_error() {
        let inner = StoreError::NotFound("runs/x".to_string());
        let err: EngineError = inner.into();
        assert!(matches!(err, EngineError::Store(StoreError::NotFound(_))));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&AgentCallError::Unavailable("x".into()));
        assert_std_error(&RoundError::AllAgentsFailed { personas: 1 });
        assert_std_error(&StoreError::NotFound("k".into()));
        assert_std_error(&ConflictError::Taxonomy {
            question: "q".into(),
        });
        assert_std_error(&FeedbackError::Github("x".into()));
        assert_std_error(&EngineError::RunNotFound("r".into()));
    }
}
