//! Construction-time configuration for an [`crate::ArrayManager`]

use crate::error::{Error, Result};
use coheron_backends::{ExecutionSpace, DEFAULT_ALIGNMENT};
use serde::{Deserialize, Serialize};
use std::env;

/// Settings read once when a manager is built.
///
/// ```rust
/// use coheron_core::{ExecutionSpace, ManagerConfig};
///
/// let config = ManagerConfig::from_json_str(r#"{ "default_space": "device" }"#).unwrap();
/// assert_eq!(config.default_space, Some(ExecutionSpace::Device));
/// assert_eq!(config.alignment, 64);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerConfig {
    /// Space used whenever `Unspecified` is requested. When `None`, the
    /// default can still be set once at runtime and otherwise falls back to
    /// `Host`.
    pub default_space: Option<ExecutionSpace>,
    /// Alignment of allocations made by the built-in host backend.
    pub alignment: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_space: None,
            alignment: DEFAULT_ALIGNMENT,
        }
    }
}

impl ManagerConfig {
    /// Build a configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `COHERON_DEFAULT_SPACE` - `host`, `device`, `pinned` or `unified`
    /// - `COHERON_ALIGNMENT` - allocation alignment in bytes (power of two)
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(space) = env::var("COHERON_DEFAULT_SPACE") {
            if !space.trim().is_empty() {
                let parsed = space
                    .parse::<ExecutionSpace>()
                    .map_err(|err| Error::Configuration(err.to_string()))?;
                config.default_space = Some(parsed);
            }
        }

        if let Ok(alignment) = env::var("COHERON_ALIGNMENT") {
            config.alignment = alignment
                .trim()
                .parse::<usize>()
                .map_err(|err| Error::Configuration(format!("COHERON_ALIGNMENT={alignment:?}: {err}")))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document such as `{"default_space": "device", "alignment": 128}`.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|err| Error::Configuration(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_space == Some(ExecutionSpace::Unspecified) {
            return Err(Error::Configuration(
                "default space must be a storage space".to_string(),
            ));
        }
        if !self.alignment.is_power_of_two() {
            return Err(Error::Configuration(format!(
                "alignment {} is not a power of two",
                self.alignment
            )));
        }
        Ok(())
    }
}
