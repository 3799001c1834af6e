//! Kernel configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::DEFAULT_CACHE_CAPACITY;
use crate::jobs::JobConfig;
use crate::limits::ResourceLimits;

/// Errors loading a configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    /// The contents were not valid configuration JSON
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Everything needed to build a [`Kernel`](crate::Kernel)
///
/// Every field has a default, so `{}` is a valid configuration:
///
/// ```json
/// {
///   "limits": { "max_memory_bytes": 67108864, "max_output_bytes": 1048576, "timeout": 30000 },
///   "cache_capacity": 16,
///   "jobs": { "max_jobs": 32, "retention": 300000, "sweep_interval": 30000 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Default limits for modules that do not bring their own
    pub limits: ResourceLimits,
    /// Number of compiled modules kept in the LRU cache
    pub cache_capacity: usize,
    /// Job table settings
    pub jobs: JobConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            jobs: JobConfig::default(),
        }
    }
}

impl KernelConfig {
    /// Parse a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
