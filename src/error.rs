//! Error types shared across the orchestration core.
//!
//! Subsystems define their own error enums next to their code
//! (`RunnerError`, `LedgerError`, `StoreError`, ...); this module holds
//! the pieces that cross subsystem boundaries:
//!
//! - `FailureKind`: the coarse taxonomy recorded on failed tasks, which
//!   lets a caller tell "your algorithm crashed" from "the platform
//!   failed you"
//! - `ValidationError`: rejected requests, returned synchronously from
//!   `submit` before any task record exists

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of why a task failed.
///
/// Every FAILED or STOPPED task record carries exactly one of these
/// alongside a human-readable detail string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// The request was malformed. Never stored on a task record; it is
    /// returned synchronously from `submit` instead.
    Validation,
    /// Workspace allocation or input staging failed before any
    /// container was launched.
    SetupFailure,
    /// The image could not be resolved or the container backend refused
    /// the launch.
    ContainerLaunchFailure,
    /// The container ran and failed: non-zero exit, out-of-memory kill,
    /// or required output files missing despite a zero exit.
    ContainerRuntimeFailure,
    /// The run succeeded but uploading outputs or creating the result
    /// record failed. Locally produced artifacts are preserved.
    ResultPersistenceFailure,
    /// The task was stopped by an explicit user request.
    Cancelled,
}

impl FailureKind {
    /// Stable string form used in the ledger and in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Validation => "VALIDATION",
            FailureKind::SetupFailure => "SETUP_FAILURE",
            FailureKind::ContainerLaunchFailure => "CONTAINER_LAUNCH_FAILURE",
            FailureKind::ContainerRuntimeFailure => "CONTAINER_RUNTIME_FAILURE",
            FailureKind::ResultPersistenceFailure => "RESULT_PERSISTENCE_FAILURE",
            FailureKind::Cancelled => "CANCELLED",
        }
    }

    /// Parses the stable string form back into a kind.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "VALIDATION" => Some(FailureKind::Validation),
            "SETUP_FAILURE" => Some(FailureKind::SetupFailure),
            "CONTAINER_LAUNCH_FAILURE" => Some(FailureKind::ContainerLaunchFailure),
            "CONTAINER_RUNTIME_FAILURE" => Some(FailureKind::ContainerRuntimeFailure),
            "RESULT_PERSISTENCE_FAILURE" => Some(FailureKind::ResultPersistenceFailure),
            "CANCELLED" => Some(FailureKind::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while validating a job request.
///
/// These are returned from `submit` before a task record is created, so
/// a rejected request leaves no trace in the ledger.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Unknown built-in algorithm '{0}'")]
    UnknownBuiltin(String),

    #[error("Custom algorithm must supply exactly one of a tarball blob or a registry image")]
    AmbiguousAlgorithmSource,

    #[error("Custom algorithm supplies neither a tarball blob nor a registry image")]
    MissingAlgorithmSource,

    #[error("Predict request is missing a trained model reference")]
    MissingModel,

    #[error("Invalid column selection: {0}")]
    InvalidColumnSelection(String),

    #[error("Dataset reference is empty")]
    MissingDataset,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_round_trip() {
        for kind in [
            FailureKind::Validation,
            FailureKind::SetupFailure,
            FailureKind::ContainerLaunchFailure,
            FailureKind::ContainerRuntimeFailure,
            FailureKind::ResultPersistenceFailure,
            FailureKind::Cancelled,
        ] {
            assert_eq!(FailureKind::parse(kind.as_str()), Some(kind));
        }

        assert_eq!(FailureKind::parse("NOT_A_KIND"), None);
    }

    #[test]
    fn test_failure_kind_serde_form() {
        let json = serde_json::to_string(&FailureKind::ContainerRuntimeFailure).unwrap();
        assert_eq!(json, "\"CONTAINER_RUNTIME_FAILURE\"");

        let parsed: FailureKind = serde_json::from_str("\"SETUP_FAILURE\"").unwrap();
        assert_eq!(parsed, FailureKind::SetupFailure);
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::MissingAlgorithmSource;
        assert!(err.to_string().contains("neither"));

        let err = ValidationError::UnknownBuiltin("j49".to_string());
        assert!(err.to_string().contains("j49"));
    }
}
