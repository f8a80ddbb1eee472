use crate::demean::DemeanOptions;
use crate::types::VarianceType;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Errors from reading or writing an engine configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Demeaning tolerance must be positive and finite, got {0}.")]
    InvalidTolerance(f64),
}

/// Knobs shared by every fit. Every field has a default, so a TOML file only
/// needs the keys it wants to change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Convergence threshold on the Euclidean norm of one demeaning pass.
    pub tolerance: f64,
    /// Pass cap for multi-dimension demeaning. Unbounded when absent.
    pub max_demean_iterations: Option<usize>,
    pub try_cholesky: bool,
    pub variance_type: VarianceType,
    /// Compute degrees of freedom (needed for confidence intervals).
    pub compute_dof: bool,
    /// Relative diagonal threshold for pivoted-QR rank detection.
    pub rank_tolerance: Option<f64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let demean = DemeanOptions::default();
        Self {
            tolerance: demean.tolerance,
            max_demean_iterations: demean.max_iterations,
            try_cholesky: true,
            variance_type: VarianceType::default(),
            compute_dof: true,
            rank_tolerance: None,
        }
    }
}

impl EngineConfig {
    pub fn demean_options(&self) -> DemeanOptions {
        DemeanOptions {
            tolerance: self.tolerance,
            max_iterations: self.max_demean_iterations,
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = self.to_toml_string()?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(text.as_bytes())?;
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tolerance.is_finite() && self.tolerance > 0.0 {
            Ok(())
        } else {
            Err(ConfigError::InvalidTolerance(self.tolerance))
        }
    }
}
