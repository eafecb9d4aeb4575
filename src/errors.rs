//! Typed error hierarchy for the conductor orchestration core.
//!
//! Three top-level enums cover the three subsystems:
//! - `CoordinationError` — lock acquisition/release failures
//! - `StateError` — persisted workflow document failures
//! - `AgentError` — agent registry and executor failures
//!
//! Only `CoordinationError::LockExhausted` aborts a synchronous state
//! operation; everything else degrades to logged, observable state.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the cross-process lock coordinator.
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error(
        "Failed to acquire state lock after {attempts} attempts (held by PID {holder_pid} on {holder_host})"
    )]
    LockExhausted {
        attempts: u32,
        holder_pid: u32,
        holder_host: String,
    },

    #[error("Failed to write lock marker at {path}: {source}")]
    MarkerWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove lock marker at {path}: {source}")]
    MarkerRemoveFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the persisted state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Workflow document is missing required field '{field}'")]
    MissingField { field: String },

    #[error("Failed to read workflow document at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write workflow document at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize workflow document: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Unknown backup '{name}'")]
    UnknownBackup { name: String },

    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}

/// Errors from the agent registry. Execution and restart failures are not
/// errors here: they feed the per-agent health state machine instead.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Unknown agent '{name}'")]
    UnknownAgent { name: String },
}

/// Errors from the phase state machine.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Unknown phase '{name}'")]
    UnknownPhase { name: String },

    #[error("No phase is currently active")]
    NoActivePhase,

    #[error(transparent)]
    State(#[from] StateError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_exhausted_carries_holder_identity() {
        let err = CoordinationError::LockExhausted {
            attempts: 10,
            holder_pid: 4242,
            holder_host: "buildbox".to_string(),
        };
        match &err {
            CoordinationError::LockExhausted {
                attempts,
                holder_pid,
                holder_host,
            } => {
                assert_eq!(*attempts, 10);
                assert_eq!(*holder_pid, 4242);
                assert_eq!(holder_host, "buildbox");
            }
            _ => panic!("Expected LockExhausted variant"),
        }
        assert!(err.to_string().contains("4242"));
    }

    #[test]
    fn state_error_missing_field_is_matchable() {
        let err = StateError::MissingField {
            field: "current_phase".to_string(),
        };
        assert!(matches!(err, StateError::MissingField { .. }));
        assert!(err.to_string().contains("current_phase"));
    }

    #[test]
    fn state_error_converts_from_coordination_error() {
        let inner = CoordinationError::LockExhausted {
            attempts: 3,
            holder_pid: 1,
            holder_host: "other".to_string(),
        };
        let state_err: StateError = inner.into();
        assert!(matches!(
            state_err,
            StateError::Coordination(CoordinationError::LockExhausted { .. })
        ));
    }

    #[test]
    fn read_failed_carries_path_and_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = StateError::ReadFailed {
            path: PathBuf::from("/work/.conductor/workflow.json"),
            source: io_err,
        };
        match &err {
            StateError::ReadFailed { path, source } => {
                assert_eq!(path, &PathBuf::from("/work/.conductor/workflow.json"));
                assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected ReadFailed"),
        }
    }

    #[test]
    fn phase_error_converts_from_state_error() {
        let inner = StateError::MissingField {
            field: "status".to_string(),
        };
        let phase_err: PhaseError = inner.into();
        assert!(matches!(phase_err, PhaseError::State(_)));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&CoordinationError::MarkerRemoveFailed {
            path: PathBuf::from("x"),
            source: std::io::Error::other("boom"),
        });
        assert_std_error(&StateError::UnknownBackup { name: "b".into() });
        assert_std_error(&AgentError::UnknownAgent { name: "a".into() });
        assert_std_error(&PhaseError::NoActivePhase);
    }
}
