//! Error types for the deepseis core library.
//!
//! Configuration problems are reported with the dotted key that caused them
//! (e.g. `TRAIN.MAX_LR`) so a failed run points straight at the offending line.

use std::path::PathBuf;

/// Errors raised while loading or validating an experiment configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration parse error in {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Missing required field: {key}")]
    MissingField { key: String },

    #[error("Invalid type for {key}: expected {expected}, found {found}")]
    InvalidType {
        key: String,
        expected: String,
        found: String,
    },

    #[error("Invalid option for {key}: '{value}' (expected one of: {expected})")]
    InvalidOption {
        key: String,
        value: String,
        expected: String,
    },

    #[error("Unknown configuration key: {key}")]
    UnknownKey { key: String },

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Malformed override '{entry}': expected KEY=VALUE")]
    MalformedOverride { entry: String },

    #[error("Configuration inheritance cycle through {path}")]
    BaseCycle { path: PathBuf },
}

impl ConfigError {
    pub fn invalid_value(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// The dotted configuration key this error refers to, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::MissingField { key }
            | Self::InvalidType { key, .. }
            | Self::InvalidOption { key, .. }
            | Self::UnknownKey { key }
            | Self::InvalidValue { key, .. } => Some(key),
            _ => None,
        }
    }
}

fn join_key(path: &[String], leaf: Option<&str>) -> String {
    let mut parts: Vec<&str> = path.iter().map(String::as_str).collect();
    if let Some(leaf) = leaf {
        parts.push(leaf);
    }
    if parts.is_empty() {
        "<root>".to_string()
    } else {
        parts.join(".")
    }
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        use figment::error::Kind;

        let key = join_key(&err.path, None);
        match &err.kind {
            Kind::MissingField(field) => Self::MissingField {
                key: join_key(&err.path, Some(field)),
            },
            Kind::InvalidType(actual, expected) => Self::InvalidType {
                key,
                expected: expected.clone(),
                found: actual.to_string(),
            },
            Kind::UnknownVariant(value, expected) => Self::InvalidOption {
                key,
                value: value.clone(),
                expected: expected.join(", "),
            },
            Kind::UnknownField(field, _) => Self::UnknownKey {
                key: join_key(&err.path, Some(field)),
            },
            _ => Self::InvalidValue {
                key,
                reason: err.kind.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_names_key() {
        let err = ConfigError::MissingField {
            key: "DATASET.ROOT".into(),
        };
        assert_eq!(err.to_string(), "Missing required field: DATASET.ROOT");
        assert_eq!(err.key(), Some("DATASET.ROOT"));
    }

    #[test]
    fn test_join_key_root() {
        assert_eq!(join_key(&[], None), "<root>");
        assert_eq!(
            join_key(&["TRAIN".to_string()], Some("STD")),
            "TRAIN.STD"
        );
    }

    #[test]
    fn test_file_not_found_has_no_key() {
        let err = ConfigError::FileNotFound {
            path: PathBuf::from("missing.yaml"),
        };
        assert!(err.key().is_none());
    }
}
