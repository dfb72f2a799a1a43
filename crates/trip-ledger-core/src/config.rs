//! Ledger configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LedgerConfig {
    #[serde(default)]
    pub split: SplitConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
}

/// Tolerances applied to multi-target split links
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SplitConfig {
    /// Allowed distance of a percentage split sum from 100
    #[serde(default = "default_percentage_tolerance")]
    pub percentage_tolerance: f64,

    /// Allowed distance of a fixed split sum from the expense amount
    #[serde(default = "default_fixed_amount_tolerance")]
    pub fixed_amount_tolerance: f64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            percentage_tolerance: default_percentage_tolerance(),
            fixed_amount_tolerance: default_fixed_amount_tolerance(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SweepPolicy {
    /// Violations are logged and the write stands
    #[default]
    Advisory,
    /// Violations reject the write
    Blocking,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ValidationConfig {
    /// What to do when the post-write boundary sweep finds violations
    #[serde(default)]
    pub post_write_sweep: SweepPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationConfig {
    /// Write migrated documents back on load
    #[serde(default = "default_true")]
    pub persist_on_load: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            persist_on_load: true,
        }
    }
}

// Defaults
fn default_percentage_tolerance() -> f64 { 0.5 }
fn default_fixed_amount_tolerance() -> f64 { 0.01 }
fn default_true() -> bool { true }

impl LedgerConfig {
    /// # Errors
    /// Returns [`ConfigError::Parse`] for malformed TOML and
    /// [`ConfigError::Invalid`] when a value is out of range.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`ConfigError::Read`] when the file cannot be read, otherwise
    /// the errors of [`LedgerConfig::from_toml_str`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Loads `path` when given, otherwise returns defaults.
    ///
    /// # Errors
    /// See [`LedgerConfig::load`].
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// # Errors
    /// Returns [`ConfigError::Invalid`] for negative or non-finite tolerances.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("split.percentage_tolerance", self.split.percentage_tolerance),
            ("split.fixed_amount_tolerance", self.split.fixed_amount_tolerance),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a finite, non-negative number"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = match LedgerConfig::from_toml_str("") {
            Ok(config) => config,
            Err(err) => panic!("parse failed: {err}"),
        };
        assert_eq!(config, LedgerConfig::default());
        assert!((config.split.percentage_tolerance - 0.5).abs() < f64::EPSILON);
        assert!((config.split.fixed_amount_tolerance - 0.01).abs() < f64::EPSILON);
        assert_eq!(config.validation.post_write_sweep, SweepPolicy::Advisory);
        assert!(config.migration.persist_on_load);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let raw = r#"
            [validation]
            post_write_sweep = "blocking"

            [split]
            percentage_tolerance = 1.0
        "#;
        let config = match LedgerConfig::from_toml_str(raw) {
            Ok(config) => config,
            Err(err) => panic!("parse failed: {err}"),
        };
        assert_eq!(config.validation.post_write_sweep, SweepPolicy::Blocking);
        assert!((config.split.percentage_tolerance - 1.0).abs() < f64::EPSILON);
        assert!((config.split.fixed_amount_tolerance - 0.01).abs() < f64::EPSILON);
    }

    #[test]
    fn negative_tolerance_is_rejected() {
        let err = LedgerConfig::from_toml_str("[split]\nfixed_amount_tolerance = -0.1\n");
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unknown_policy_is_a_parse_error() {
        let err = LedgerConfig::from_toml_str("[validation]\npost_write_sweep = \"sometimes\"\n");
        assert!(matches!(err, Err(ConfigError::Parse(_))));
    }
}
