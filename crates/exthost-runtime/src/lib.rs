//! Extension host runtime.
//!
//! This crate loads extensions, attaches script contexts ("instances") to
//! them and routes messages both ways.
//!
//! # Architecture
//!
//! An extension implements the [`Extension`] trait. When loaded into an
//! [`ExtensionHost`] it registers a name and a script API through a
//! [`Registrar`]. Every attached [`Instance`] gets its own message callbacks,
//! bound through the [`HostContext`] handed to the extension.
//!
//! - **Async messages** go to the extension's message callback; replies come
//!   back later through [`HostContext::post_message`].
//! - **Sync messages** return the callback's reply directly.
//! - **Deferred tasks** scheduled with [`HostContext::schedule_after`] are
//!   owned by the host and cancelled with their instance.
//!
//! [`ScriptBridge`] runs the script side of an instance in Rhai, and
//! [`ScriptedExtension`] lets the extension itself be a Rhai script.
//!
//! # Example
//!
//! ```ignore
//! use exthost_runtime::{ExtensionHost, ScriptBridge};
//!
//! let host = ExtensionHost::load(MyExtension, HostConfig::default())?;
//! let mut bridge = ScriptBridge::attach(&host)?;
//! bridge.eval(r#"ping("hello", |reply| print(reply))"#)?;
//! bridge.next_reply().await?;
//! ```

mod bridge;
mod extension;
mod host;
mod manager;
mod manifest;
mod scheduler;
mod script;
mod scripted;

pub use bridge::{Delivery, ScriptBridge};
pub use extension::{Extension, MessageCallback, Registrar, Registration, SyncMessageCallback};
pub use host::{ExtensionHost, HostContext, Instance};
pub use manager::ExtensionManager;
pub use manifest::ExtensionManifest;
pub use scheduler::{TaskFlow, TaskId};
pub use scripted::{ScriptedExtension, discover};
