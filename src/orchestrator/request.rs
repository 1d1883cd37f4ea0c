//! Job requests and synchronous validation.
//!
//! Validation happens inside `submit`, before a task record exists: a
//! rejected request returns a `ValidationError` to the caller and
//! leaves no trace in the ledger.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::{self, AlgorithmReference, ResolvedAlgorithm};
use crate::config::OrchestratorConfig;
use crate::contract::ColumnSelection;
use crate::error::ValidationError;
use crate::runner::ResourceLimits;

/// Whether a job trains a model or runs predictions with one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Train,
    Predict,
}

impl JobKind {
    /// The command argument handed to the container.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Train => "train",
            JobKind::Predict => "predict",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job submission, as it arrives from the caller.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub kind: JobKind,
    /// Dataset blob key in the datasets bucket.
    pub dataset: Uuid,
    pub algorithm: AlgorithmReference,
    /// Trained model to predict with. Required for predict jobs.
    pub model_id: Option<Uuid>,
    /// Per-key overrides applied over the algorithm's default options.
    pub option_overrides: BTreeMap<String, String>,
    /// Comma-separated 1-based feature column indices.
    pub feature_columns: Option<String>,
    /// Target column name or 1-based index.
    pub target_column: Option<String>,
    pub limits: ResourceLimits,
}

impl JobRequest {
    pub fn train(dataset: Uuid, algorithm: AlgorithmReference) -> Self {
        Self {
            kind: JobKind::Train,
            dataset,
            algorithm,
            model_id: None,
            option_overrides: BTreeMap::new(),
            feature_columns: None,
            target_column: None,
            limits: ResourceLimits::default(),
        }
    }

    pub fn predict(dataset: Uuid, algorithm: AlgorithmReference, model_id: Uuid) -> Self {
        Self {
            kind: JobKind::Predict,
            dataset,
            algorithm,
            model_id: Some(model_id),
            option_overrides: BTreeMap::new(),
            feature_columns: None,
            target_column: None,
            limits: ResourceLimits::default(),
        }
    }

    pub fn with_option_override(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.option_overrides.insert(key.into(), value.into());
        self
    }

    pub fn with_feature_columns(mut self, columns: impl Into<String>) -> Self {
        self.feature_columns = Some(columns.into());
        self
    }

    pub fn with_target_column(mut self, target: impl Into<String>) -> Self {
        self.target_column = Some(target.into());
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Validates the request against the deployment configuration.
    ///
    /// Checks everything checkable without touching storage: algorithm
    /// resolution, column spec syntax, and the predict/model pairing.
    pub fn validate(&self, config: &OrchestratorConfig) -> Result<ValidatedJob, ValidationError> {
        if self.dataset.is_nil() {
            return Err(ValidationError::MissingDataset);
        }

        let algorithm =
            catalog::resolve(&self.algorithm, &self.option_overrides, &config.builtin_image)?;

        let selection = ColumnSelection::parse(
            self.feature_columns.as_deref(),
            self.target_column.as_deref(),
        )
        .map_err(|e| ValidationError::InvalidColumnSelection(e.to_string()))?;

        let model_id = match self.kind {
            JobKind::Predict => Some(self.model_id.ok_or(ValidationError::MissingModel)?),
            JobKind::Train => None,
        };

        Ok(ValidatedJob {
            kind: self.kind,
            dataset: self.dataset,
            algorithm,
            selection,
            model_id,
            limits: self.limits,
        })
    }
}

/// A request that passed validation: algorithm resolved, column spec
/// parsed, everything the worker needs.
#[derive(Debug, Clone)]
pub struct ValidatedJob {
    pub kind: JobKind,
    pub dataset: Uuid,
    pub algorithm: ResolvedAlgorithm,
    pub selection: ColumnSelection,
    pub model_id: Option<Uuid>,
    pub limits: ResourceLimits,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ImageSource;
    use crate::contract::AlgorithmType;

    fn builtin(name: &str) -> AlgorithmReference {
        AlgorithmReference::Builtin {
            name: name.to_string(),
        }
    }

    #[test]
    fn test_validate_train_request() {
        let config = OrchestratorConfig::default();
        let request = JobRequest::train(Uuid::new_v4(), builtin("j48"))
            .with_feature_columns("1,2,3")
            .with_target_column("4");

        let job = request.validate(&config).unwrap();
        assert_eq!(job.kind, JobKind::Train);
        assert_eq!(job.algorithm.class_name, "weka.classifiers.trees.J48");
        assert_eq!(job.selection.feature_indices, vec![1, 2, 3]);
        assert!(job.model_id.is_none());
        assert_eq!(
            job.algorithm.image,
            ImageSource::Registry(config.builtin_image.clone())
        );
    }

    #[test]
    fn test_validate_rejects_unknown_builtin() {
        let request = JobRequest::train(Uuid::new_v4(), builtin("quantum-forest"));
        assert!(matches!(
            request.validate(&OrchestratorConfig::default()),
            Err(ValidationError::UnknownBuiltin(_))
        ));
    }

    #[test]
    fn test_validate_rejects_nil_dataset() {
        let request = JobRequest::train(Uuid::nil(), builtin("j48"));
        assert!(matches!(
            request.validate(&OrchestratorConfig::default()),
            Err(ValidationError::MissingDataset)
        ));
    }

    #[test]
    fn test_validate_predict_requires_model() {
        let mut request = JobRequest::predict(Uuid::new_v4(), builtin("j48"), Uuid::new_v4());
        request.model_id = None;

        assert!(matches!(
            request.validate(&OrchestratorConfig::default()),
            Err(ValidationError::MissingModel)
        ));
    }

    #[test]
    fn test_validate_rejects_bad_column_spec() {
        let request = JobRequest::train(Uuid::new_v4(), builtin("j48"))
            .with_feature_columns("1,zero,3");

        assert!(matches!(
            request.validate(&OrchestratorConfig::default()),
            Err(ValidationError::InvalidColumnSelection(_))
        ));
    }

    #[test]
    fn test_validate_custom_algorithm() {
        let reference = AlgorithmReference::Custom {
            class_name: "acme.Boost".to_string(),
            algorithm_type: AlgorithmType::Regression,
            tarball_blob: None,
            registry_image: Some("ghcr.io/acme/boost:2".to_string()),
            default_options: Some("-D 6".to_string()),
        };
        let request = JobRequest::train(Uuid::new_v4(), reference)
            .with_option_override("D", "8");

        let job = request.validate(&OrchestratorConfig::default()).unwrap();
        assert_eq!(job.algorithm.options.as_deref(), Some("-D 8"));
        assert_eq!(
            job.algorithm.image,
            ImageSource::Registry("ghcr.io/acme/boost:2".to_string())
        );
    }

    #[test]
    fn test_job_kind_command_argument() {
        assert_eq!(JobKind::Train.as_str(), "train");
        assert_eq!(JobKind::Predict.as_str(), "predict");
    }
}
