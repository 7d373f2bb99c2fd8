//! Host configuration types.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::error::{HostError, HostResult};

/// Configuration for an extension host.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct HostConfig {
    /// Maximum number of simultaneously active instances.
    #[builder(default = "64")]
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,

    /// Directory scanned for scripted extensions.
    #[builder(default = "default_extension_dir()")]
    #[serde(default = "default_extension_dir")]
    pub extension_dir: PathBuf,

    /// Extension names that must not be loaded.
    #[builder(default)]
    #[serde(default)]
    pub disabled_extensions: HashSet<String>,

    /// Resource limits applied to every script engine.
    #[builder(default)]
    #[serde(default)]
    pub script: ScriptLimits,
}

fn default_max_instances() -> usize {
    64
}

fn default_extension_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("exthost")
        .join("extensions")
}

impl HostConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.max_instances == Some(0) {
            return Err("max_instances must be at least 1".to_string());
        }
        Ok(())
    }
}

impl HostConfig {
    /// Create a new host config builder.
    pub fn builder() -> HostConfigBuilder {
        HostConfigBuilder::default()
    }

    /// Load a config from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> HostResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Parse a config from TOML text.
    pub fn from_toml(content: &str) -> HostResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| HostError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the config for values the host cannot work with.
    pub fn validate(&self) -> HostResult<()> {
        if self.max_instances == 0 {
            return Err(HostError::Config {
                message: "max_instances must be at least 1".to_string(),
            });
        }
        if self.script.max_operations == 0 {
            return Err(HostError::Config {
                message: "script.max_operations must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Use a different extension directory.
    pub fn with_extension_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.extension_dir = dir.into();
        self
    }

    /// Disable a specific extension.
    pub fn disable_extension(mut self, name: impl Into<String>) -> Self {
        self.disabled_extensions.insert(name.into());
        self
    }

    /// Check if an extension is disabled.
    pub fn is_disabled(&self, name: &str) -> bool {
        self.disabled_extensions.contains(name)
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_instances: default_max_instances(),
            extension_dir: default_extension_dir(),
            disabled_extensions: HashSet::new(),
            script: ScriptLimits::default(),
        }
    }
}

/// Limits applied to script engines created by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptLimits {
    /// Maximum number of operations per evaluation.
    pub max_operations: u64,
    /// Maximum function call depth.
    pub max_call_levels: usize,
    /// Maximum expression nesting depth.
    pub max_expr_depth: usize,
    /// Maximum string length in bytes.
    pub max_string_size: usize,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            max_operations: 1_000_000,
            max_call_levels: 64,
            max_expr_depth: 64,
            max_string_size: 1024 * 1024, // 1MB strings
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = HostConfig::builder()
            .max_instances(4usize)
            .extension_dir("/opt/ext")
            .build()
            .unwrap();

        assert_eq!(config.max_instances, 4);
        assert_eq!(config.extension_dir, PathBuf::from("/opt/ext"));
        assert!(config.disabled_extensions.is_empty());
    }

    #[test]
    fn test_builder_rejects_zero_instances() {
        let result = HostConfig::builder().max_instances(0usize).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.max_instances, 64);
        assert_eq!(config.script.max_operations, 1_000_000);
        assert!(config.extension_dir.ends_with("exthost/extensions"));
    }

    #[test]
    fn test_from_toml_partial() {
        let config = HostConfig::from_toml(
            r#"
            max_instances = 8
            disabled_extensions = ["noisy"]

            [script]
            max_operations = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.max_instances, 8);
        assert!(config.is_disabled("noisy"));
        assert_eq!(config.script.max_operations, 500);
        assert_eq!(config.script.max_call_levels, 64);
    }

    #[test]
    fn test_from_toml_rejects_zero_instances() {
        let err = HostConfig::from_toml("max_instances = 0").unwrap_err();
        assert!(matches!(err, HostError::Config { .. }));
    }

    #[test]
    fn test_disable_extension() {
        let config = HostConfig::default().disable_extension("example");
        assert!(config.is_disabled("example"));
        assert!(!config.is_disabled("other"));
    }
}
