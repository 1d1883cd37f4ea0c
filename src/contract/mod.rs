//! The algorithm execution contract.
//!
//! Any runnable image honors a file-based protocol rather than a library
//! call: the in-container process reads `params.json` plus the input CSV
//! from the input root, and writes its outputs to the output root. The
//! two roots are handed to the container through the `DATA_DIR` and
//! `MODEL_DIR` environment variables, identically on every backend.
//!
//! Inputs (written by the orchestrator):
//!
//! - `params.json` — algorithm identity, type, options, column spec
//! - `dataset.csv` (train) / `test_data.csv` (predict)
//! - `model.ser` and optionally `header.ser` for predict jobs
//!
//! Outputs (written by the container, validated for presence here):
//!
//! - TRAIN: `model.ser` + `metrics.json`
//! - PREDICT: `predictions.csv` + `prediction_metadata.json`
//!
//! The orchestrator never deep-parses metrics or predictions; presence
//! of the required files plus a zero exit code is what "success" means.

pub mod dataset;
pub mod outputs;
pub mod params;

use thiserror::Error;

pub use dataset::{ColumnSelection, CsvTable, SelectedDataset, TargetColumn};
pub use outputs::{required_outputs, verify_outputs};
pub use params::{AlgorithmType, RunParams, PARAMS_SCHEMA_VERSION};

/// Environment variable carrying the container-visible input root.
pub const DATA_DIR_ENV: &str = "DATA_DIR";
/// Environment variable carrying the container-visible output root.
pub const MODEL_DIR_ENV: &str = "MODEL_DIR";

/// Input file names.
pub const PARAMS_FILE: &str = "params.json";
pub const TRAIN_DATASET_FILE: &str = "dataset.csv";
pub const PREDICT_DATASET_FILE: &str = "test_data.csv";
/// Trained model, input for predict and output of train.
pub const MODEL_FILE: &str = "model.ser";
/// Serialized training header carrying class-label vocabulary.
pub const HEADER_FILE: &str = "header.ser";

/// Output file names.
pub const METRICS_FILE: &str = "metrics.json";
pub const PREDICTIONS_FILE: &str = "predictions.csv";
pub const PREDICTION_METADATA_FILE: &str = "prediction_metadata.json";

/// Marker written into cells whose value is unknown, including every
/// cell of a synthesized placeholder target column.
pub const MISSING_VALUE: &str = "?";

/// Errors raised while materializing or checking contract files.
#[derive(Debug, Error)]
pub enum ContractError {
    #[error("Unsupported params schema version {0} (expected {PARAMS_SCHEMA_VERSION})")]
    UnsupportedSchemaVersion(u32),

    #[error("Dataset is empty")]
    EmptyDataset,

    #[error("Malformed CSV at line {line}: {reason}")]
    MalformedCsv { line: usize, reason: String },

    #[error("Invalid column selection: {0}")]
    InvalidColumnSelection(String),

    #[error("Required output file '{0}' was not produced")]
    MissingOutput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
