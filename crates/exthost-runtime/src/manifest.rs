//! Scripted extension manifests.

use std::path::{Component, Path, PathBuf};

use exthost_core::{HostError, HostResult};
use serde::{Deserialize, Serialize};

/// Metadata about a scripted extension from its `extension.toml` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionManifest {
    /// Extension name (unique identifier).
    pub name: String,

    /// Extension version.
    #[serde(default = "default_version")]
    pub version: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Extension author.
    #[serde(default)]
    pub author: String,

    /// Entry point script (relative to the extension directory).
    #[serde(default = "default_entry")]
    pub entry: String,

    /// File holding the script API, used when the entry script sets none.
    #[serde(default)]
    pub api: Option<String>,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

fn default_entry() -> String {
    "main.rhai".to_string()
}

impl ExtensionManifest {
    /// Name of the manifest file inside an extension directory.
    pub const FILE_NAME: &'static str = "extension.toml";

    /// Read and validate the manifest of an extension directory.
    pub fn load(dir: &Path) -> HostResult<Self> {
        let path = dir.join(Self::FILE_NAME);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| HostError::manifest(&path, e))?;
        let manifest: Self = toml::from_str(&content).map_err(|e| HostError::manifest(&path, e))?;
        manifest.validate(&path)?;
        Ok(manifest)
    }

    /// Check that names and file references are usable.
    pub fn validate(&self, path: &Path) -> HostResult<()> {
        if self.name.trim().is_empty() {
            return Err(HostError::manifest(path, "name cannot be empty"));
        }
        if !is_contained(&self.entry) {
            return Err(HostError::manifest(
                path,
                format!("entry must be a relative path inside the extension: {}", self.entry),
            ));
        }
        if let Some(api) = &self.api {
            if !is_contained(api) {
                return Err(HostError::manifest(
                    path,
                    format!("api must be a relative path inside the extension: {api}"),
                ));
            }
        }
        Ok(())
    }

    /// Full path of the entry script.
    pub fn entry_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.entry)
    }

    /// Full path of the API file, if any.
    pub fn api_path(&self, dir: &Path) -> Option<PathBuf> {
        self.api.as_ref().map(|api| dir.join(api))
    }
}

fn is_contained(relative: &str) -> bool {
    let path = Path::new(relative);
    !relative.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
