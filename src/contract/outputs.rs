//! Required-output validation.
//!
//! A container exiting zero is not success by itself: the required
//! output files must exist in the output root. A missing file turns the
//! run into a failure even on a clean exit.

use std::path::Path;

use super::{ContractError, METRICS_FILE, MODEL_FILE, PREDICTIONS_FILE, PREDICTION_METADATA_FILE};
use crate::orchestrator::JobKind;

/// The files a job of the given kind must produce.
pub fn required_outputs(kind: JobKind) -> &'static [&'static str] {
    match kind {
        JobKind::Train => &[MODEL_FILE, METRICS_FILE],
        JobKind::Predict => &[PREDICTIONS_FILE, PREDICTION_METADATA_FILE],
    }
}

/// Checks that every required output exists and is a regular file.
///
/// Returns the first missing file as a `ContractError::MissingOutput`.
pub async fn verify_outputs(output_root: &Path, kind: JobKind) -> Result<(), ContractError> {
    for name in required_outputs(kind) {
        let path = output_root.join(name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            _ => return Err(ContractError::MissingOutput((*name).to_string())),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_outputs_per_kind() {
        assert_eq!(required_outputs(JobKind::Train), &[MODEL_FILE, METRICS_FILE]);
        assert_eq!(
            required_outputs(JobKind::Predict),
            &[PREDICTIONS_FILE, PREDICTION_METADATA_FILE]
        );
    }

    #[tokio::test]
    async fn test_verify_outputs_missing_model() {
        let dir = tempfile::tempdir().unwrap();
        // Metrics present, model missing: still a failure.
        tokio::fs::write(dir.path().join(METRICS_FILE), b"{}")
            .await
            .unwrap();

        let err = verify_outputs(dir.path(), JobKind::Train).await.unwrap_err();
        assert!(matches!(err, ContractError::MissingOutput(ref f) if f == MODEL_FILE));
    }

    #[tokio::test]
    async fn test_verify_outputs_complete() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(MODEL_FILE), b"model")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join(METRICS_FILE), b"{}")
            .await
            .unwrap();

        assert!(verify_outputs(dir.path(), JobKind::Train).await.is_ok());
    }

    #[tokio::test]
    async fn test_verify_outputs_directory_does_not_count() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(dir.path().join(PREDICTIONS_FILE))
            .await
            .unwrap();
        tokio::fs::write(dir.path().join(PREDICTION_METADATA_FILE), b"{}")
            .await
            .unwrap();

        assert!(verify_outputs(dir.path(), JobKind::Predict).await.is_err());
    }
}
