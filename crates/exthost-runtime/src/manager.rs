//! Several loaded extensions, keyed by name.

use std::sync::Arc;

use exthost_core::{HostConfig, HostError, HostResult};
use indexmap::IndexMap;

use crate::extension::Extension;
use crate::host::ExtensionHost;
use crate::scripted;

/// Holds one [`ExtensionHost`] per loaded extension, in load order.
#[derive(Debug)]
pub struct ExtensionManager {
    config: HostConfig,
    hosts: IndexMap<String, ExtensionHost>,
}

impl ExtensionManager {
    /// Create an empty manager. Every host it loads shares `config`.
    pub fn new(config: HostConfig) -> HostResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            hosts: IndexMap::new(),
        })
    }

    /// Configuration passed to every host.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Load an extension and return its registered name.
    pub fn load<E: Extension>(&mut self, extension: E) -> HostResult<String> {
        self.load_shared(Arc::new(extension))
    }

    /// Load an already shared extension.
    pub fn load_shared(&mut self, extension: Arc<dyn Extension>) -> HostResult<String> {
        let host = ExtensionHost::load_shared(extension, self.config.clone())?;
        let name = host.name().to_string();
        if self.hosts.contains_key(&name) {
            return Err(HostError::DuplicateExtension { name });
        }
        self.hosts.insert(name.clone(), host);
        Ok(name)
    }

    /// Load every scripted extension found in the configured extension
    /// directory. Returns the names that were loaded.
    pub fn discover(&mut self) -> HostResult<Vec<String>> {
        let dir = self.config.extension_dir.clone();
        let mut names = vec![];
        for extension in scripted::discover(&dir, &self.config)? {
            names.push(self.load(extension)?);
        }
        tracing::info!(dir = %dir.display(), count = names.len(), "discovered extensions");
        Ok(names)
    }

    /// Host of a loaded extension.
    pub fn get(&self, name: &str) -> Option<&ExtensionHost> {
        self.hosts.get(name)
    }

    /// Names of all loaded extensions, in load order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.hosts.keys().map(String::as_str)
    }

    /// Number of loaded extensions.
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Whether no extension is loaded.
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Shut down and remove one extension. Returns `false` if it was not loaded.
    pub async fn unload(&mut self, name: &str) -> bool {
        match self.hosts.shift_remove(name) {
            Some(host) => {
                host.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Shut down every extension, most recently loaded first.
    pub async fn shutdown(mut self) {
        while let Some((_, host)) = self.hosts.pop() {
            host.shutdown().await;
        }
    }
}
