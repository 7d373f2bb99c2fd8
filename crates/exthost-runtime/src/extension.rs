//! Extension trait and registration.
//!
//! An extension is loaded once per host. During [`Extension::register`] it
//! declares its public name and the script API that every attached script
//! context evaluates. Per-instance message callbacks are bound later, from
//! [`Extension::on_instance_created`].

use std::sync::Arc;

use exthost_core::{HostError, HostResult, InstanceId};

use crate::host::HostContext;

/// Callback receiving async messages for one instance.
pub type MessageCallback = Arc<dyn Fn(&HostContext, InstanceId, &str) + Send + Sync>;

/// Callback answering sync messages for one instance.
///
/// Returning `None` sends an empty reply.
pub type SyncMessageCallback =
    Arc<dyn Fn(&HostContext, InstanceId, &str) -> Option<String> + Send + Sync>;

/// Trait implemented by every extension the host can load.
pub trait Extension: Send + Sync + 'static {
    /// Declare the extension name and script API.
    ///
    /// Called exactly once, before any instance exists.
    fn register(&self, registrar: &mut Registrar) -> HostResult<()>;

    /// A script context attached. Bind message callbacks here.
    fn on_instance_created(&self, ctx: &HostContext, instance: InstanceId) -> HostResult<()>;

    /// A script context detached. Pending tasks of the instance are already
    /// cancelled when this runs.
    fn on_instance_destroyed(&self, _ctx: &HostContext, _instance: InstanceId) {}

    /// The host is shutting down.
    fn on_shutdown(&self) {}
}

/// Collects the declarations an extension makes while registering.
#[derive(Debug, Default)]
pub struct Registrar {
    name: Option<String>,
    script_api: Option<String>,
}

/// A completed registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Public extension name.
    pub name: String,
    /// Script evaluated in every attached script context.
    pub script_api: String,
}

impl Registrar {
    /// Create an empty registrar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the public extension name. May be called once.
    pub fn set_extension_name(&mut self, name: impl Into<String>) -> HostResult<()> {
        if let Some(existing) = &self.name {
            return Err(HostError::NameAlreadySet {
                name: existing.clone(),
            });
        }
        self.name = Some(name.into());
        Ok(())
    }

    /// Set the script API source. May be called once.
    pub fn set_script_api(&mut self, source: impl Into<String>) -> HostResult<()> {
        if self.script_api.is_some() {
            return Err(HostError::ApiAlreadySet {
                name: self.name.clone().unwrap_or_default(),
            });
        }
        self.script_api = Some(source.into());
        Ok(())
    }

    /// The name declared so far.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Validate and produce the final registration.
    pub fn finish(self) -> HostResult<Registration> {
        let name = self
            .name
            .ok_or(HostError::IncompleteRegistration { missing: "name" })?;
        let script_api = self
            .script_api
            .ok_or(HostError::IncompleteRegistration {
                missing: "script API",
            })?;

        if !is_valid_name(&name) {
            return Err(HostError::InvalidName { name });
        }

        Ok(Registration { name, script_api })
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}
