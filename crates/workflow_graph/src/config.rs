// SPDX-License-Identifier: MIT OR Apache-2.0
//! Engine configuration, stored as RON.

use crate::history::MAX_HISTORY;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read or written
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// RON could not be parsed
    #[error("Parse error: {0}")]
    Parse(#[from] ron::error::SpannedError),

    /// RON could not be written
    #[error("Write error: {0}")]
    Write(#[from] ron::Error),

    /// A value is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Settings of a mutation service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of undo steps kept
    pub max_history: usize,
    /// Offset applied to pasted nodes
    pub paste_offset: [f64; 2],
    /// Offset applied to cloned nodes
    pub clone_offset: [f64; 2],
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_history: MAX_HISTORY,
            paste_offset: [10.0, 10.0],
            clone_offset: [5.0, 5.0],
        }
    }
}

impl EngineConfig {
    /// Parse from RON. Missing fields take their defaults.
    pub fn from_ron(source: &str) -> Result<Self, ConfigError> {
        let config: Self = ron::from_str(source)?;
        if config.max_history == 0 {
            return Err(ConfigError::Invalid("max_history must be at least 1".into()));
        }
        Ok(config)
    }

    /// Write as pretty RON
    pub fn to_ron(&self) -> Result<String, ConfigError> {
        Ok(ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?)
    }

    /// Load from a RON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_ron(&content)
    }

    /// Save to a RON file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        std::fs::write(path, self.to_ron()?)?;
        Ok(())
    }
}
