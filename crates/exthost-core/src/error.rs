//! Error types for host operations.

use std::path::PathBuf;

use thiserror::Error;

use crate::message::{InstanceId, MessageKind};

/// Result type for host operations.
pub type HostResult<T> = Result<T, HostError>;

/// Errors that can occur while loading extensions or exchanging messages.
#[derive(Debug, Error)]
pub enum HostError {
    /// The extension tried to set its name a second time.
    #[error("Extension name already set: {name}")]
    NameAlreadySet { name: String },

    /// The extension tried to set its script API a second time.
    #[error("Script API already set for extension '{name}'")]
    ApiAlreadySet { name: String },

    /// Registration finished without a name or without a script API.
    #[error("Extension name or script API not set (missing {missing})")]
    IncompleteRegistration { missing: &'static str },

    /// The extension name is not a usable identifier.
    #[error("Invalid extension name: {name:?}")]
    InvalidName { name: String },

    /// The extension is listed in the disabled set.
    #[error("Extension '{name}' is disabled")]
    ExtensionDisabled { name: String },

    /// An extension with the same name is already loaded.
    #[error("Extension '{name}' is already registered")]
    DuplicateExtension { name: String },

    /// The instance was destroyed or never existed.
    #[error("Instance {instance} is not active")]
    InstanceGone { instance: InstanceId },

    /// Too many active instances.
    #[error("Instance limit reached ({max})")]
    InstanceLimit { max: usize },

    /// A callback of this kind is already bound to the instance.
    #[error("{kind} message callback already set for instance {instance}")]
    CallbackAlreadySet {
        instance: InstanceId,
        kind: MessageKind,
    },

    /// No tokio runtime is available to drive deferred tasks.
    #[error("No async runtime available")]
    NoRuntime,

    /// The host has been shut down.
    #[error("Host is shut down")]
    ShutDown,

    /// A script failed to compile or run.
    #[error("Script error in '{name}': {message}")]
    Script { name: String, message: String },

    /// An extension manifest is missing or malformed.
    #[error("Invalid extension manifest at {path}: {message}")]
    Manifest { path: PathBuf, message: String },

    /// Invalid host configuration.
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostError {
    /// Create a script error for the named script.
    pub fn script(name: impl Into<String>, message: impl ToString) -> Self {
        Self::Script {
            name: name.into(),
            message: message.to_string(),
        }
    }

    /// Create a manifest error for the given path.
    pub fn manifest(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::Manifest {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Whether the error means the target instance no longer exists.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::InstanceGone { .. })
    }
}
