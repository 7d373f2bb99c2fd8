//! Script bridge: the script-facing side of an instance.
//!
//! A [`ScriptBridge`] attaches one instance to a host and evaluates the
//! extension's script API in a Rhai engine. The API is written against three
//! native functions:
//!
//! - `extension_post_message(msg)`: async message to the extension
//! - `extension_send_sync_message(msg)`: sync message, returns the reply
//! - `extension_set_message_listener(fn)`: callback for posted replies
//!
//! Replies posted by the extension queue up on the instance until they are
//! delivered with [`ScriptBridge::next_reply`] or [`ScriptBridge::drain`];
//! each delivery calls the current listener exactly once.

use std::sync::{Arc, Mutex, PoisonError};

use exthost_core::{Envelope, HostError, HostResult};
use rhai::{AST, Dynamic, Engine, EvalAltResult, FnPtr, FuncArgs, Scope};

use crate::host::{ExtensionHost, HostContext, Instance};
use crate::script;

/// Outcome of delivering one posted reply.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The reply as posted by the extension.
    pub envelope: Envelope,
    /// What the listener returned; `None` when no listener was set.
    pub result: Option<Dynamic>,
}

/// One attached script context.
pub struct ScriptBridge {
    engine: Engine,
    functions: AST,
    scope: Scope<'static>,
    listener: Arc<Mutex<Option<FnPtr>>>,
    instance: Instance,
    name: String,
}

impl std::fmt::Debug for ScriptBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptBridge")
            .field("extension", &self.name)
            .field("instance", &self.instance.id())
            .finish()
    }
}

impl ScriptBridge {
    /// Attach a new instance of the host's extension.
    pub fn attach(host: &ExtensionHost) -> HostResult<Self> {
        Self::attach_to(host.context())
    }

    /// Attach through a host context.
    pub fn attach_to(ctx: &HostContext) -> HostResult<Self> {
        let instance = ctx.create_instance()?;
        let id = instance.id();
        let name = ctx.name().to_string();

        let mut engine = script::new_engine(&ctx.config().script);
        let listener: Arc<Mutex<Option<FnPtr>>> = Arc::new(Mutex::new(None));

        let post_ctx = ctx.clone();
        engine.register_fn(
            "extension_post_message",
            move |message: &str| -> Result<(), Box<EvalAltResult>> {
                post_ctx
                    .dispatch_message(id, message)
                    .map_err(script::host_error)
            },
        );

        let sync_ctx = ctx.clone();
        engine.register_fn(
            "extension_send_sync_message",
            move |message: &str| -> Result<String, Box<EvalAltResult>> {
                sync_ctx
                    .dispatch_sync_message(id, message)
                    .map_err(script::host_error)
            },
        );

        let slot = Arc::clone(&listener);
        engine.register_fn("extension_set_message_listener", move |callback: FnPtr| {
            *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(callback);
        });

        let api = engine
            .compile(ctx.script_api())
            .map_err(|e| HostError::script(&name, e))?;
        let mut scope = Scope::new();
        engine
            .run_ast_with_scope(&mut scope, &api)
            .map_err(|e| HostError::script(&name, e))?;

        tracing::debug!(extension = %name, instance = %id, "script bridge attached");

        Ok(Self {
            engine,
            functions: api.clone_functions_only(),
            scope,
            listener,
            instance,
            name,
        })
    }

    /// The attached instance.
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Run client code. Functions it defines stay callable afterwards.
    pub fn eval(&mut self, source: &str) -> HostResult<Dynamic> {
        let client = self
            .engine
            .compile(source)
            .map_err(|e| HostError::script(&self.name, e))?;
        let program = self.functions.merge(&client);

        // Closures handed out before a failure must still resolve later.
        self.functions = self.functions.merge(&client.clone_functions_only());

        self.engine
            .eval_ast_with_scope::<Dynamic>(&mut self.scope, &program)
            .map_err(|e| HostError::script(&self.name, e))
    }

    /// Call a script function by name.
    pub fn call(&mut self, function: &str, args: impl FuncArgs) -> HostResult<Dynamic> {
        self.engine
            .call_fn::<Dynamic>(&mut self.scope, &self.functions, function, args)
            .map_err(|e| HostError::script(&self.name, e))
    }

    /// Whether a listener has been installed.
    pub fn has_listener(&self) -> bool {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Invoke the listener once with the envelope's payload.
    pub fn deliver(&mut self, envelope: Envelope) -> HostResult<Delivery> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let result = match listener {
            Some(callback) => Some(
                callback
                    .call::<Dynamic>(&self.engine, &self.functions, (envelope.payload.clone(),))
                    .map_err(|e| HostError::script(&self.name, e))?,
            ),
            None => {
                tracing::debug!(instance = %envelope.instance, "reply arrived without a listener");
                None
            }
        };

        Ok(Delivery { envelope, result })
    }

    /// Wait for the next posted reply and deliver it.
    ///
    /// Returns `None` once the instance is gone and no replies remain.
    pub async fn next_reply(&mut self) -> HostResult<Option<Delivery>> {
        match self.instance.recv().await {
            Some(envelope) => self.deliver(envelope).map(Some),
            None => Ok(None),
        }
    }

    /// Deliver every reply that is already queued.
    pub fn drain(&mut self) -> HostResult<Vec<Delivery>> {
        let mut deliveries = vec![];
        while let Some(envelope) = self.instance.try_recv() {
            deliveries.push(self.deliver(envelope)?);
        }
        Ok(deliveries)
    }

    /// Detach: destroys the instance.
    pub fn close(self) -> HostResult<()> {
        self.instance.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::{Extension, Registrar};
    use exthost_core::{HostConfig, InstanceId};

    /// Replies to every async message right away with the upper-cased text.
    struct Shout;

    const API: &str = r#"
        fn shout(msg, callback) {
            extension_set_message_listener(callback);
            extension_post_message(msg);
        }
        fn whisper(msg) {
            extension_send_sync_message(msg)
        }
    "#;

    impl Extension for Shout {
        fn register(&self, registrar: &mut Registrar) -> HostResult<()> {
            registrar.set_extension_name("shout")?;
            registrar.set_script_api(API)
        }

        fn on_instance_created(&self, ctx: &HostContext, instance: InstanceId) -> HostResult<()> {
            ctx.set_message_callback(instance, |ctx, instance, message| {
                let _ = ctx.post_message(instance, message.to_uppercase());
            })?;
            ctx.set_sync_message_callback(instance, |_, _, message| {
                Some(message.to_lowercase())
            })
        }
    }

    #[tokio::test]
    async fn test_sync_call_through_api() {
        let host = ExtensionHost::load(Shout, HostConfig::default()).unwrap();
        let mut bridge = ScriptBridge::attach(&host).unwrap();

        let reply = bridge.eval(r#"whisper("QUIET")"#).unwrap();
        assert_eq!(reply.into_string().unwrap(), "quiet");
    }

    #[tokio::test]
    async fn test_listener_gets_each_reply_once() {
        let host = ExtensionHost::load(Shout, HostConfig::default()).unwrap();
        let mut bridge = ScriptBridge::attach(&host).unwrap();

        let _ = bridge.eval(r#"shout("hey", |reply| "got " + reply)"#).unwrap();
        assert!(bridge.has_listener());

        let deliveries = bridge.drain().unwrap();
        assert_eq!(deliveries.len(), 1);
        let result = deliveries[0].result.clone().unwrap();
        assert_eq!(result.into_string().unwrap(), "got HEY");

        assert!(bridge.drain().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_client_functions_persist() {
        let host = ExtensionHost::load(Shout, HostConfig::default()).unwrap();
        let mut bridge = ScriptBridge::attach(&host).unwrap();

        let _ = bridge.eval("fn twice(x) { x + x }").unwrap();
        let value = bridge.call("twice", ("ab".to_string(),)).unwrap();
        assert_eq!(value.into_string().unwrap(), "abab");
    }

    #[tokio::test]
    async fn test_listener_survives_failed_eval() {
        let host = ExtensionHost::load(Shout, HostConfig::default()).unwrap();
        let mut bridge = ScriptBridge::attach(&host).unwrap();

        let err = bridge
            .eval(r#"shout("hi", |reply| "got " + reply); throw "later failure";"#)
            .unwrap_err();
        assert!(matches!(err, HostError::Script { .. }));

        let deliveries = bridge.drain().unwrap();
        assert_eq!(deliveries.len(), 1);
        let result = deliveries[0].result.clone().unwrap();
        assert_eq!(result.into_string().unwrap(), "got HI");
    }

    #[tokio::test]
    async fn test_script_errors_are_reported() {
        let host = ExtensionHost::load(Shout, HostConfig::default()).unwrap();
        let mut bridge = ScriptBridge::attach(&host).unwrap();

        let err = bridge.eval("let = ;").unwrap_err();
        assert!(matches!(err, HostError::Script { ref name, .. } if name == "shout"));
    }

    #[tokio::test]
    async fn test_close_destroys_instance() {
        let host = ExtensionHost::load(Shout, HostConfig::default()).unwrap();
        let bridge = ScriptBridge::attach(&host).unwrap();
        let id = bridge.instance().id();

        assert_eq!(host.active_instances(), vec![id]);
        bridge.close().unwrap();
        assert!(host.active_instances().is_empty());
    }
}
