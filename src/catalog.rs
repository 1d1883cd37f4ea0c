//! Built-in algorithm catalog and algorithm reference resolution.
//!
//! Built-in algorithms map a fixed platform name to a runner class,
//! algorithm family and default option string; they all execute inside
//! the platform's own runner image. Custom algorithms bring their own
//! image, as either a stored tarball blob or a registry reference —
//! exactly one of the two.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::contract::params::normalize_options;
use crate::contract::AlgorithmType;
use crate::error::ValidationError;

/// One entry in the built-in algorithm table.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinAlgorithm {
    /// Platform-facing name, e.g. "random-forest".
    pub name: &'static str,
    /// Class the runner instantiates.
    pub class_name: &'static str,
    pub algorithm_type: AlgorithmType,
    /// Default option string, overridable key-by-key per request.
    pub default_options: &'static str,
}

/// The fixed built-in table.
const BUILTINS: &[BuiltinAlgorithm] = &[
    BuiltinAlgorithm {
        name: "j48",
        class_name: "weka.classifiers.trees.J48",
        algorithm_type: AlgorithmType::Classification,
        default_options: "-C 0.25 -M 2",
    },
    BuiltinAlgorithm {
        name: "random-forest",
        class_name: "weka.classifiers.trees.RandomForest",
        algorithm_type: AlgorithmType::Classification,
        default_options: "-I 100 -K 0 -S 1",
    },
    BuiltinAlgorithm {
        name: "naive-bayes",
        class_name: "weka.classifiers.bayes.NaiveBayes",
        algorithm_type: AlgorithmType::Classification,
        default_options: "",
    },
    BuiltinAlgorithm {
        name: "logistic",
        class_name: "weka.classifiers.functions.Logistic",
        algorithm_type: AlgorithmType::Classification,
        default_options: "-R 1.0E-8 -M -1",
    },
    BuiltinAlgorithm {
        name: "ibk",
        class_name: "weka.classifiers.lazy.IBk",
        algorithm_type: AlgorithmType::Classification,
        default_options: "-K 3 -W 0 -A weka.core.EuclideanDistance -R first-last",
    },
    BuiltinAlgorithm {
        name: "smo",
        class_name: "weka.classifiers.functions.SMO",
        algorithm_type: AlgorithmType::Classification,
        default_options: "-C 1.0 -L 0.001 -P 1.0E-12",
    },
    BuiltinAlgorithm {
        name: "linear-regression",
        class_name: "weka.classifiers.functions.LinearRegression",
        algorithm_type: AlgorithmType::Regression,
        default_options: "-S 0 -R 1.0E-8",
    },
    BuiltinAlgorithm {
        name: "m5p",
        class_name: "weka.classifiers.trees.M5P",
        algorithm_type: AlgorithmType::Regression,
        default_options: "-M 4.0",
    },
    BuiltinAlgorithm {
        name: "kmeans",
        class_name: "weka.clusterers.SimpleKMeans",
        algorithm_type: AlgorithmType::Clustering,
        default_options: "-N 3 -A weka.core.EuclideanDistance -R first-last -I 500",
    },
    BuiltinAlgorithm {
        name: "em",
        class_name: "weka.clusterers.EM",
        algorithm_type: AlgorithmType::Clustering,
        default_options: "-I 100 -N -1",
    },
];

/// Looks up a built-in algorithm by platform name.
pub fn builtin(name: &str) -> Option<&'static BuiltinAlgorithm> {
    BUILTINS.iter().find(|a| a.name == name)
}

/// All built-in algorithms, for listings.
pub fn builtins() -> &'static [BuiltinAlgorithm] {
    BUILTINS
}

/// Where the executable image for a job comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Pull from a registry by reference, e.g. "ghcr.io/acme/algo:1".
    Registry(String),
    /// Import from a stored image tarball blob.
    Tarball(Uuid),
}

/// A fully resolved algorithm: everything the worker needs to write
/// `params.json` and pick an image.
#[derive(Debug, Clone)]
pub struct ResolvedAlgorithm {
    pub class_name: String,
    pub algorithm_type: AlgorithmType,
    /// Defaults merged with request overrides, normalized.
    pub options: Option<String>,
    pub image: ImageSource,
}

/// How a request names its algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlgorithmReference {
    /// A platform built-in, by name.
    Builtin { name: String },
    /// A user-supplied image honoring the execution contract. Exactly
    /// one of `tarball_blob` and `registry_image` must be present.
    Custom {
        class_name: String,
        algorithm_type: AlgorithmType,
        tarball_blob: Option<Uuid>,
        registry_image: Option<String>,
        default_options: Option<String>,
    },
}

/// Resolves an algorithm reference against the built-in table.
///
/// `builtin_image` is the deployment's runner image for built-ins.
/// `overrides` win key-by-key over the algorithm's default options.
pub fn resolve(
    reference: &AlgorithmReference,
    overrides: &BTreeMap<String, String>,
    builtin_image: &str,
) -> Result<ResolvedAlgorithm, ValidationError> {
    match reference {
        AlgorithmReference::Builtin { name } => {
            let entry =
                builtin(name).ok_or_else(|| ValidationError::UnknownBuiltin(name.clone()))?;
            let options = merge_options(entry.default_options, overrides);
            Ok(ResolvedAlgorithm {
                class_name: entry.class_name.to_string(),
                algorithm_type: entry.algorithm_type,
                options,
                image: ImageSource::Registry(builtin_image.to_string()),
            })
        }
        AlgorithmReference::Custom {
            class_name,
            algorithm_type,
            tarball_blob,
            registry_image,
            default_options,
        } => {
            let image = match (tarball_blob, registry_image) {
                (Some(_), Some(_)) => return Err(ValidationError::AmbiguousAlgorithmSource),
                (None, None) => return Err(ValidationError::MissingAlgorithmSource),
                (Some(blob), None) => ImageSource::Tarball(*blob),
                (None, Some(image)) => ImageSource::Registry(image.clone()),
            };
            let options = merge_options(default_options.as_deref().unwrap_or(""), overrides);
            Ok(ResolvedAlgorithm {
                class_name: class_name.clone(),
                algorithm_type: *algorithm_type,
                options,
                image,
            })
        }
    }
}

/// Merges a default option string with per-key overrides.
///
/// Option strings are flag/value token lists ("-C 0.25 -M 2"). Override
/// keys are flag names without the dash; an empty override value turns
/// the flag into a bare switch. Keys absent from the defaults are
/// appended in key order.
pub fn merge_options(
    defaults: &str,
    overrides: &BTreeMap<String, String>,
) -> Option<String> {
    let mut pairs = parse_option_pairs(defaults);
    let mut remaining: BTreeMap<&String, &String> = overrides.iter().collect();

    for (flag, value) in &mut pairs {
        let key = flag.trim_start_matches('-').to_string();
        if let Some(new_value) = remaining.remove(&key) {
            *value = if new_value.is_empty() {
                None
            } else {
                Some((*new_value).clone())
            };
        }
    }

    for (key, value) in remaining {
        let flag = format!("-{key}");
        let value = if value.is_empty() {
            None
        } else {
            Some(value.clone())
        };
        pairs.push((flag, value));
    }

    let merged = pairs
        .iter()
        .flat_map(|(flag, value)| {
            std::iter::once(flag.clone()).chain(value.clone())
        })
        .collect::<Vec<_>>()
        .join(" ");

    if merged.is_empty() {
        None
    } else {
        Some(normalize_options(&merged))
    }
}

/// Splits an option string into (flag, optional value) pairs. A token
/// starting with '-' that is not a number opens a new flag; anything
/// else attaches to the previous flag as its value.
fn parse_option_pairs(options: &str) -> Vec<(String, Option<String>)> {
    let mut pairs: Vec<(String, Option<String>)> = Vec::new();

    for token in options.split_whitespace() {
        let is_flag = token.starts_with('-') && token[1..].parse::<f64>().is_err();
        if is_flag {
            pairs.push((token.to_string(), None));
        } else if let Some(last) = pairs.last_mut() {
            match &mut last.1 {
                Some(existing) => {
                    existing.push(' ');
                    existing.push_str(token);
                }
                None => last.1 = Some(token.to_string()),
            }
        }
        // A value with no preceding flag is dropped.
    }

    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        let rf = builtin("random-forest").unwrap();
        assert_eq!(rf.class_name, "weka.classifiers.trees.RandomForest");
        assert_eq!(rf.algorithm_type, AlgorithmType::Classification);

        assert!(builtin("does-not-exist").is_none());
        assert!(!builtins().is_empty());
    }

    #[test]
    fn test_resolve_builtin() {
        let reference = AlgorithmReference::Builtin {
            name: "j48".to_string(),
        };
        let resolved = resolve(&reference, &BTreeMap::new(), "acme/runner:1").unwrap();

        assert_eq!(resolved.class_name, "weka.classifiers.trees.J48");
        assert_eq!(resolved.options.as_deref(), Some("-C 0.25 -M 2"));
        assert_eq!(
            resolved.image,
            ImageSource::Registry("acme/runner:1".to_string())
        );
    }

    #[test]
    fn test_resolve_unknown_builtin() {
        let reference = AlgorithmReference::Builtin {
            name: "j49".to_string(),
        };
        let err = resolve(&reference, &BTreeMap::new(), "img").unwrap_err();
        assert!(matches!(err, ValidationError::UnknownBuiltin(_)));
    }

    #[test]
    fn test_resolve_custom_requires_exactly_one_source() {
        let neither = AlgorithmReference::Custom {
            class_name: "acme.Algo".to_string(),
            algorithm_type: AlgorithmType::Classification,
            tarball_blob: None,
            registry_image: None,
            default_options: None,
        };
        assert!(matches!(
            resolve(&neither, &BTreeMap::new(), "img"),
            Err(ValidationError::MissingAlgorithmSource)
        ));

        let both = AlgorithmReference::Custom {
            class_name: "acme.Algo".to_string(),
            algorithm_type: AlgorithmType::Classification,
            tarball_blob: Some(Uuid::new_v4()),
            registry_image: Some("acme/algo:1".to_string()),
            default_options: None,
        };
        assert!(matches!(
            resolve(&both, &BTreeMap::new(), "img"),
            Err(ValidationError::AmbiguousAlgorithmSource)
        ));
    }

    #[test]
    fn test_resolve_custom_tarball() {
        let blob = Uuid::new_v4();
        let reference = AlgorithmReference::Custom {
            class_name: "acme.Algo".to_string(),
            algorithm_type: AlgorithmType::Regression,
            tarball_blob: Some(blob),
            registry_image: None,
            default_options: Some("-D 5".to_string()),
        };
        let resolved = resolve(&reference, &BTreeMap::new(), "img").unwrap();

        assert_eq!(resolved.image, ImageSource::Tarball(blob));
        assert_eq!(resolved.options.as_deref(), Some("-D 5"));
    }

    #[test]
    fn test_merge_options_override_wins() {
        let mut overrides = BTreeMap::new();
        overrides.insert("M".to_string(), "5".to_string());

        let merged = merge_options("-C 0.25 -M 2", &overrides).unwrap();
        assert_eq!(merged, "-C 0.25 -M 5");
    }

    #[test]
    fn test_merge_options_appends_new_keys() {
        let mut overrides = BTreeMap::new();
        overrides.insert("S".to_string(), "42".to_string());

        let merged = merge_options("-C 0.25", &overrides).unwrap();
        assert_eq!(merged, "-C 0.25 -S 42");
    }

    #[test]
    fn test_merge_options_bare_switch() {
        let mut overrides = BTreeMap::new();
        overrides.insert("U".to_string(), String::new());

        let merged = merge_options("-C 0.25", &overrides).unwrap();
        assert_eq!(merged, "-C 0.25 -U");
    }

    #[test]
    fn test_merge_options_negative_values_attach_to_flag() {
        let merged = merge_options("-M -1 -R 1.0E-8", &BTreeMap::new()).unwrap();
        assert_eq!(merged, "-M -1 -R 1.0E-8");
    }

    #[test]
    fn test_merge_options_empty() {
        assert!(merge_options("", &BTreeMap::new()).is_none());
    }
}
