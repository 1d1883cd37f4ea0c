//! The `params.json` schema.
//!
//! This file is the algorithm side of the contract: identity, type, an
//! opaque option string, and the column spec the host already applied
//! (the container re-applies it so both sides agree on layout).

use serde::{Deserialize, Serialize};

use super::ContractError;

/// Current schema version written into every `params.json`.
pub const PARAMS_SCHEMA_VERSION: u32 = 1;

/// Broad family of the algorithm; decides which metrics document the
/// container emits and whether a target column exists at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlgorithmType {
    Classification,
    Regression,
    Clustering,
}

impl AlgorithmType {
    /// Clustering has no target column; the selection logic skips the
    /// placeholder machinery entirely for it.
    pub fn has_target(&self) -> bool {
        !matches!(self, AlgorithmType::Clustering)
    }
}

impl std::fmt::Display for AlgorithmType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlgorithmType::Classification => write!(f, "CLASSIFICATION"),
            AlgorithmType::Regression => write!(f, "REGRESSION"),
            AlgorithmType::Clustering => write!(f, "CLUSTERING"),
        }
    }
}

/// Contents of `params.json`, version 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunParams {
    /// Schema version; readers reject versions they do not know.
    pub schema_version: u32,
    /// Fully qualified class/operation name the runner instantiates.
    pub algorithm_class_name: String,
    /// Algorithm family.
    pub algorithm_type: AlgorithmType,
    /// Opaque algorithm-specific option string, already normalized.
    #[serde(default)]
    pub options: Option<String>,
    /// Target column as a name or 1-based index. Null means "last
    /// column" for train and "synthesized placeholder" for predict.
    #[serde(default)]
    pub target_column: Option<String>,
    /// Comma-separated 1-based feature column indices. Null means all.
    #[serde(default)]
    pub basic_attributes_columns: Option<String>,
    /// Class-label vocabulary from training, carried into predict jobs
    /// so numeric predictions map back to symbolic labels.
    #[serde(default)]
    pub class_labels: Option<Vec<String>>,
}

impl RunParams {
    /// Creates params for the given algorithm with no column spec.
    pub fn new(class_name: impl Into<String>, algorithm_type: AlgorithmType) -> Self {
        Self {
            schema_version: PARAMS_SCHEMA_VERSION,
            algorithm_class_name: class_name.into(),
            algorithm_type,
            options: None,
            target_column: None,
            basic_attributes_columns: None,
            class_labels: None,
        }
    }

    /// Sets the option string, normalizing it first.
    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        let options = options.into();
        self.options = if options.is_empty() {
            None
        } else {
            Some(normalize_options(&options))
        };
        self
    }

    /// Sets the target column (name or 1-based index as a string).
    pub fn with_target_column(mut self, target: impl Into<String>) -> Self {
        self.target_column = Some(target.into());
        self
    }

    /// Sets the feature column index list.
    pub fn with_basic_attributes_columns(mut self, columns: impl Into<String>) -> Self {
        self.basic_attributes_columns = Some(columns.into());
        self
    }

    /// Sets the class-label vocabulary for predict jobs.
    pub fn with_class_labels(mut self, labels: Vec<String>) -> Self {
        self.class_labels = Some(labels);
        self
    }

    /// Parses and version-checks a `params.json` document.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ContractError> {
        let params: RunParams = serde_json::from_slice(bytes)?;
        if params.schema_version != PARAMS_SCHEMA_VERSION {
            return Err(ContractError::UnsupportedSchemaVersion(params.schema_version));
        }
        Ok(params)
    }

    /// Serializes to the pretty-printed form written into the workspace.
    pub fn to_json(&self) -> Result<Vec<u8>, ContractError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

/// Repairs option strings that round-tripped badly through the option
/// editor: nested EuclideanDistance arguments lose their quoting, and
/// numbers sometimes arrive with a dangling exponent ("1.0E").
pub fn normalize_options(raw: &str) -> String {
    let mut fixed = raw.to_string();

    if fixed.contains("-A weka.core.EuclideanDistance") && fixed.contains("-R first-last") {
        fixed = fixed.replace(
            "-A weka.core.EuclideanDistance -R first-last",
            "-A \"weka.core.EuclideanDistance -R first-last\"",
        );
    }

    repair_dangling_exponents(&fixed)
}

/// Drops a trailing `E`/`e` after a decimal number when no exponent
/// digits follow it.
fn repair_dangling_exponents(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if (c == 'E' || c == 'e') && i > 0 && chars[i - 1].is_ascii_digit() {
            // Only a real exponent if digits (optionally signed) follow.
            let mut j = i + 1;
            if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                j += 1;
            }
            let has_exponent_digits = j < chars.len() && chars[j].is_ascii_digit();
            // And only part of a decimal literal if a '.' preceded the digits.
            let mut k = i;
            let mut saw_dot = false;
            while k > 0 {
                let p = chars[k - 1];
                if p.is_ascii_digit() {
                    k -= 1;
                } else if p == '.' && !saw_dot {
                    saw_dot = true;
                    k -= 1;
                } else {
                    break;
                }
            }
            if saw_dot && !has_exponent_digits {
                i += 1;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_round_trip() {
        let params = RunParams::new("weka.classifiers.trees.J48", AlgorithmType::Classification)
            .with_options("-C 0.25 -M 2")
            .with_target_column("4")
            .with_basic_attributes_columns("1,2,3");

        let bytes = params.to_json().unwrap();
        let parsed = RunParams::from_json(&bytes).unwrap();

        assert_eq!(parsed, params);
    }

    #[test]
    fn test_params_camel_case_keys() {
        let params = RunParams::new("weka.clusterers.SimpleKMeans", AlgorithmType::Clustering);
        let json = String::from_utf8(params.to_json().unwrap()).unwrap();

        assert!(json.contains("\"schemaVersion\""));
        assert!(json.contains("\"algorithmClassName\""));
        assert!(json.contains("\"algorithmType\""));
        assert!(json.contains("\"basicAttributesColumns\""));
    }

    #[test]
    fn test_params_rejects_unknown_schema_version() {
        let json = serde_json::json!({
            "schemaVersion": 7,
            "algorithmClassName": "weka.classifiers.trees.J48",
            "algorithmType": "CLASSIFICATION",
        });
        let err = RunParams::from_json(json.to_string().as_bytes()).unwrap_err();

        assert!(matches!(err, ContractError::UnsupportedSchemaVersion(7)));
    }

    #[test]
    fn test_algorithm_type_serde() {
        let json = serde_json::to_string(&AlgorithmType::Regression).unwrap();
        assert_eq!(json, "\"REGRESSION\"");

        let parsed: AlgorithmType = serde_json::from_str("\"CLUSTERING\"").unwrap();
        assert_eq!(parsed, AlgorithmType::Clustering);
        assert!(!parsed.has_target());
    }

    #[test]
    fn test_normalize_options_quotes_nested_distance() {
        let raw = "-N 3 -A weka.core.EuclideanDistance -R first-last -I 500";
        let fixed = normalize_options(raw);

        assert!(fixed.contains("-A \"weka.core.EuclideanDistance -R first-last\""));
    }

    #[test]
    fn test_normalize_options_repairs_dangling_exponent() {
        assert_eq!(normalize_options("-L 0.3 -M 0.2 -E 1.0E"), "-L 0.3 -M 0.2 -E 1.0");
        // A well-formed exponent is left alone.
        assert_eq!(normalize_options("-E 1.0E-8"), "-E 1.0E-8");
        assert_eq!(normalize_options("-E 1.5e3"), "-E 1.5e3");
    }

    #[test]
    fn test_empty_options_become_none() {
        let params = RunParams::new("weka.classifiers.bayes.NaiveBayes", AlgorithmType::Classification)
            .with_options("");
        assert!(params.options.is_none());
    }
}
