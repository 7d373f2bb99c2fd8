//! The "example" echo extension.
//!
//! Every instance gets two callbacks:
//!
//! - async messages are answered once, after a delay (2 seconds by default),
//!   with a reply posted back to the same instance;
//! - sync messages are answered immediately.
//!
//! Both replies have the form `Hello from <source>: <instance> <message> <timestamp>`.
//!
//! The script API exposes `startTimeTick(msg, callback)` and
//! `getTimeSync(msg)` to attached script contexts.

use std::sync::Arc;
use std::time::Duration;

use exthost_core::{HostResult, InstanceId};
use exthost_runtime::{Extension, HostContext, Registrar, TaskFlow};

/// Name the extension registers with.
pub const EXTENSION_NAME: &str = "example";

/// Script API evaluated in every attached context.
pub const SCRIPT_API: &str = include_str!("api.rhai");

/// Default delay before an async reply is posted.
pub const DEFAULT_DELAY: Duration = Duration::from_secs(2);

/// Echo extension settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoConfig {
    /// Word after "Hello from" in every reply.
    pub source: String,
    /// Delay before an async reply.
    pub delay: Duration,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            source: "rust".to_string(),
            delay: DEFAULT_DELAY,
        }
    }
}

impl EchoConfig {
    /// Set the word after "Hello from".
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Set the delay before async replies.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Build a reply stamped with the current local time.
pub fn format_reply(source: &str, instance: InstanceId, message: &str) -> String {
    format!(
        "Hello from {source}: {instance} {message} {}",
        exthost_core::timestamp_now()
    )
}

/// Extension answering async messages late and sync messages right away.
#[derive(Debug, Clone, Default)]
pub struct EchoExtension {
    config: EchoConfig,
}

impl EchoExtension {
    /// Echo extension with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Echo extension with custom settings.
    pub fn with_config(config: EchoConfig) -> Self {
        Self { config }
    }

    /// Current settings.
    pub fn config(&self) -> &EchoConfig {
        &self.config
    }
}

impl Extension for EchoExtension {
    fn register(&self, registrar: &mut Registrar) -> HostResult<()> {
        registrar.set_extension_name(EXTENSION_NAME)?;
        registrar.set_script_api(SCRIPT_API)
    }

    fn on_instance_created(&self, ctx: &HostContext, instance: InstanceId) -> HostResult<()> {
        let source: Arc<str> = Arc::from(self.config.source.as_str());
        let delay = self.config.delay;

        let async_source = Arc::clone(&source);
        ctx.set_message_callback(instance, move |ctx, instance, message| {
            let source = Arc::clone(&async_source);
            let message = message.to_string();
            let scheduled = ctx.schedule_after(instance, delay, move |ctx| {
                let reply = format_reply(&source, instance, &message);
                if let Err(err) = ctx.post_message(instance, reply) {
                    tracing::warn!(extension = EXTENSION_NAME, %instance, error = %err, "reply not delivered");
                }
                // One reply per message.
                TaskFlow::Break
            });
            if let Err(err) = scheduled {
                tracing::warn!(extension = EXTENSION_NAME, %instance, error = %err, "could not schedule reply");
            }
        })?;

        ctx.set_sync_message_callback(instance, move |_, instance, message| {
            Some(format_reply(&source, instance, message))
        })?;

        tracing::debug!(extension = EXTENSION_NAME, %instance, "callbacks bound");
        Ok(())
    }

    fn on_instance_destroyed(&self, _ctx: &HostContext, instance: InstanceId) {
        tracing::debug!(extension = EXTENSION_NAME, %instance, "instance gone");
    }
}
