//! Extensions written in Rhai.
//!
//! A scripted extension lives in a directory with an [`ExtensionManifest`]
//! and an entry script. The entry script's top level runs once at load and
//! may declare the extension name and script API. The script then reacts to
//! instance lifecycle and messages through `on_*` hook functions, or binds
//! closures with `set_message_callback` / `set_sync_message_callback`.
//!
//! Host functions available to the script:
//!
//! - `set_extension_name(name) -> bool`, `set_script_api(src) -> bool`
//! - `post_message(instance, text)`
//! - `set_message_callback(instance, fn)`, `set_sync_message_callback(instance, fn)`
//! - `timeout_add_seconds(seconds, instance, callback, data)`
//! - `now()`, `log_info`, `log_warn`, `log_error`
//!
//! Calls that need the host are recorded while the script runs and applied
//! once the script function returns, so the engine never holds the host.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use dashmap::DashMap;
use exthost_core::{HostConfig, HostError, HostResult, InstanceId, ScriptLimits};
use rhai::{AST, Dynamic, Engine, EvalAltResult, FnPtr, FuncArgs, INT, Scope};

use crate::extension::{Extension, Registrar};
use crate::host::HostContext;
use crate::manifest::ExtensionManifest;
use crate::scheduler::TaskFlow;
use crate::script;

/// A host call made by a script, applied after the script returns.
enum Effect {
    Post {
        instance: InstanceId,
        text: String,
    },
    Timeout {
        seconds: u64,
        instance: InstanceId,
        callback: FnPtr,
        data: Dynamic,
    },
    BindMessage {
        instance: InstanceId,
        callback: FnPtr,
    },
    BindSyncMessage {
        instance: InstanceId,
        callback: FnPtr,
    },
}

/// Effects recorded per calling thread.
#[derive(Default)]
struct EffectQueue {
    pending: DashMap<ThreadId, Vec<Effect>>,
}

impl EffectQueue {
    fn push(&self, effect: Effect) {
        self.pending
            .entry(thread::current().id())
            .or_default()
            .push(effect);
    }

    fn take(&self) -> Vec<Effect> {
        self.pending
            .remove(&thread::current().id())
            .map(|(_, effects)| effects)
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct Declared {
    name: Option<String>,
    api: Option<String>,
}

/// Compiled script plus the engine that runs it.
struct ScriptRunner {
    name: String,
    engine: Engine,
    functions: AST,
    hooks: HashSet<String>,
    effects: Arc<EffectQueue>,
}

impl ScriptRunner {
    fn has_hook(&self, hook: &str) -> bool {
        self.hooks.contains(hook)
    }

    /// Call a script function, then apply what it asked of the host.
    fn call(
        self: &Arc<Self>,
        ctx: &HostContext,
        function: &str,
        args: impl FuncArgs,
    ) -> HostResult<Dynamic> {
        let result =
            self.engine
                .call_fn::<Dynamic>(&mut Scope::new(), &self.functions, function, args);
        self.finish(ctx, result)
    }

    /// Call a function pointer handed over by the script.
    fn call_ptr(
        self: &Arc<Self>,
        ctx: &HostContext,
        callback: &FnPtr,
        args: impl FuncArgs,
    ) -> HostResult<Dynamic> {
        let result = callback.call::<Dynamic>(&self.engine, &self.functions, args);
        self.finish(ctx, result)
    }

    fn finish(
        self: &Arc<Self>,
        ctx: &HostContext,
        result: Result<Dynamic, Box<EvalAltResult>>,
    ) -> HostResult<Dynamic> {
        let effects = self.effects.take();
        let value = result.map_err(|e| HostError::script(&self.name, e))?;

        // A failed host call does not cancel the ones after it.
        let mut first_error = None;
        for effect in effects {
            if let Err(err) = self.apply(ctx, effect) {
                tracing::warn!(extension = %self.name, error = %err, "host call from script failed");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(value),
        }
    }

    fn apply(self: &Arc<Self>, ctx: &HostContext, effect: Effect) -> HostResult<()> {
        match effect {
            Effect::Post { instance, text } => ctx.post_message(instance, text),
            Effect::Timeout {
                seconds,
                instance,
                callback,
                data,
            } => {
                let runner = Arc::clone(self);
                let arg = script::instance_int(instance);
                ctx.schedule_after(instance, Duration::from_secs(seconds), move |ctx| {
                    match runner.call_ptr(ctx, &callback, (arg, data.clone())) {
                        Ok(again) => TaskFlow::from(again.as_bool().unwrap_or(false)),
                        Err(err) => {
                            tracing::warn!(extension = %runner.name, %instance, error = %err, "timeout callback failed");
                            TaskFlow::Break
                        }
                    }
                })?;
                Ok(())
            }
            Effect::BindMessage { instance, callback } => {
                let runner = Arc::clone(self);
                ctx.set_message_callback(instance, move |ctx, instance, message| {
                    let args = (script::instance_int(instance), message.to_string());
                    if let Err(err) = runner.call_ptr(ctx, &callback, args) {
                        tracing::warn!(extension = %runner.name, %instance, error = %err, "message callback failed");
                    }
                })
            }
            Effect::BindSyncMessage { instance, callback } => {
                let runner = Arc::clone(self);
                ctx.set_sync_message_callback(instance, move |ctx, instance, message| {
                    let args = (script::instance_int(instance), message.to_string());
                    match runner.call_ptr(ctx, &callback, args) {
                        Ok(reply) => script::reply_text(reply),
                        Err(err) => {
                            tracing::warn!(extension = %runner.name, %instance, error = %err, "sync message callback failed");
                            None
                        }
                    }
                })
            }
        }
    }
}

/// An extension backed by a Rhai script.
pub struct ScriptedExtension {
    manifest: ExtensionManifest,
    name: String,
    script_api: Option<String>,
    runner: Arc<ScriptRunner>,
}

impl std::fmt::Debug for ScriptedExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedExtension")
            .field("name", &self.name)
            .field("version", &self.manifest.version)
            .field("hooks", &self.runner.hooks)
            .finish()
    }
}

fn register_host_api(engine: &mut Engine, effects: &Arc<EffectQueue>, declared: &Arc<Mutex<Declared>>) {
    let slot = Arc::clone(declared);
    engine.register_fn("set_extension_name", move |name: &str| -> bool {
        let mut declared = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if declared.name.is_some() {
            return false;
        }
        declared.name = Some(name.to_string());
        true
    });

    let slot = Arc::clone(declared);
    engine.register_fn("set_script_api", move |source: &str| -> bool {
        let mut declared = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if declared.api.is_some() {
            return false;
        }
        declared.api = Some(source.to_string());
        true
    });

    let queue = Arc::clone(effects);
    engine.register_fn(
        "post_message",
        move |instance: INT, text: &str| -> Result<(), Box<EvalAltResult>> {
            queue.push(Effect::Post {
                instance: script::instance_id(instance)?,
                text: text.to_string(),
            });
            Ok(())
        },
    );

    let queue = Arc::clone(effects);
    engine.register_fn(
        "timeout_add_seconds",
        move |seconds: INT,
              instance: INT,
              callback: FnPtr,
              data: Dynamic|
              -> Result<(), Box<EvalAltResult>> {
            let seconds = u64::try_from(seconds)
                .map_err(|_| format!("timeout must not be negative: {seconds}"))?;
            queue.push(Effect::Timeout {
                seconds,
                instance: script::instance_id(instance)?,
                callback,
                data,
            });
            Ok(())
        },
    );

    let queue = Arc::clone(effects);
    engine.register_fn(
        "set_message_callback",
        move |instance: INT, callback: FnPtr| -> Result<(), Box<EvalAltResult>> {
            queue.push(Effect::BindMessage {
                instance: script::instance_id(instance)?,
                callback,
            });
            Ok(())
        },
    );

    let queue = Arc::clone(effects);
    engine.register_fn(
        "set_sync_message_callback",
        move |instance: INT, callback: FnPtr| -> Result<(), Box<EvalAltResult>> {
            queue.push(Effect::BindSyncMessage {
                instance: script::instance_id(instance)?,
                callback,
            });
            Ok(())
        },
    );
}

impl ScriptedExtension {
    /// Load the extension in `dir`: read the manifest, compile the entry
    /// script and run its top level once.
    pub fn load(dir: &Path, limits: &ScriptLimits) -> HostResult<Self> {
        let manifest = ExtensionManifest::load(dir)?;
        let entry = manifest.entry_path(dir);
        let source =
            std::fs::read_to_string(&entry).map_err(|e| HostError::manifest(&entry, e))?;

        let effects = Arc::new(EffectQueue::default());
        let declared = Arc::new(Mutex::new(Declared::default()));
        let mut engine = script::new_engine(limits);
        register_host_api(&mut engine, &effects, &declared);

        let ast = engine
            .compile(&source)
            .map_err(|e| HostError::script(&manifest.name, e))?;
        engine
            .run_ast(&ast)
            .map_err(|e| HostError::script(&manifest.name, e))?;

        let stray = effects.take();
        if !stray.is_empty() {
            tracing::warn!(
                extension = %manifest.name,
                count = stray.len(),
                "ignoring host calls made while loading"
            );
        }

        let declared = std::mem::take(&mut *declared.lock().unwrap_or_else(PoisonError::into_inner));
        let name = declared.name.unwrap_or_else(|| manifest.name.clone());
        let script_api = match declared.api {
            Some(api) => Some(api),
            None => match manifest.api_path(dir) {
                Some(path) => Some(
                    std::fs::read_to_string(&path).map_err(|e| HostError::manifest(&path, e))?,
                ),
                None => None,
            },
        };

        // Detect hooks by looking for function definitions
        let hooks: HashSet<String> = ast
            .iter_functions()
            .map(|func| func.name.to_string())
            .filter(|name| name.starts_with("on_"))
            .collect();

        tracing::debug!(extension = %name, dir = %dir.display(), ?hooks, "scripted extension compiled");

        Ok(Self {
            runner: Arc::new(ScriptRunner {
                name: name.clone(),
                engine,
                functions: ast.clone_functions_only(),
                hooks,
                effects,
            }),
            manifest,
            name,
            script_api,
        })
    }

    /// Name the extension will register with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The manifest it was loaded from.
    pub fn manifest(&self) -> &ExtensionManifest {
        &self.manifest
    }

    /// Whether the script defines the given hook function.
    pub fn has_hook(&self, hook: &str) -> bool {
        self.runner.has_hook(hook)
    }
}

impl Extension for ScriptedExtension {
    fn register(&self, registrar: &mut Registrar) -> HostResult<()> {
        registrar.set_extension_name(self.name.clone())?;
        if let Some(api) = &self.script_api {
            registrar.set_script_api(api.clone())?;
        }
        Ok(())
    }

    fn on_instance_created(&self, ctx: &HostContext, instance: InstanceId) -> HostResult<()> {
        if self.runner.has_hook("on_message") {
            let runner = Arc::clone(&self.runner);
            ctx.set_message_callback(instance, move |ctx, instance, message| {
                let args = (script::instance_int(instance), message.to_string());
                if let Err(err) = runner.call(ctx, "on_message", args) {
                    tracing::warn!(extension = %runner.name, %instance, error = %err, "on_message failed");
                }
            })?;
        }

        if self.runner.has_hook("on_sync_message") {
            let runner = Arc::clone(&self.runner);
            ctx.set_sync_message_callback(instance, move |ctx, instance, message| {
                let args = (script::instance_int(instance), message.to_string());
                match runner.call(ctx, "on_sync_message", args) {
                    Ok(reply) => script::reply_text(reply),
                    Err(err) => {
                        tracing::warn!(extension = %runner.name, %instance, error = %err, "on_sync_message failed");
                        None
                    }
                }
            })?;
        }

        if self.runner.has_hook("on_instance_created") {
            self.runner
                .call(ctx, "on_instance_created", (script::instance_int(instance),))
                .map(|_| ())?;
        }
        Ok(())
    }

    fn on_instance_destroyed(&self, ctx: &HostContext, instance: InstanceId) {
        if !self.runner.has_hook("on_instance_destroyed") {
            return;
        }
        if let Err(err) = self
            .runner
            .call(ctx, "on_instance_destroyed", (script::instance_int(instance),))
        {
            tracing::warn!(extension = %self.name, %instance, error = %err, "on_instance_destroyed failed");
        }
    }

    fn on_shutdown(&self) {
        if !self.runner.has_hook("on_shutdown") {
            return;
        }
        let result = self.runner.engine.call_fn::<Dynamic>(
            &mut Scope::new(),
            &self.runner.functions,
            "on_shutdown",
            (),
        );
        // The host is gone; anything the hook asked of it is dropped.
        self.runner.effects.take();
        if let Err(err) = result {
            tracing::warn!(extension = %self.name, error = %err, "on_shutdown failed");
        }
    }
}

/// Load every scripted extension under `dir`, in directory-name order.
///
/// Subdirectories without a manifest are ignored, as are extensions the
/// configuration disables. A missing `dir` yields no extensions.
pub fn discover(dir: &Path, config: &HostConfig) -> HostResult<Vec<ScriptedExtension>> {
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut candidates: Vec<_> = std::fs::read_dir(dir)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir() && path.join(ExtensionManifest::FILE_NAME).is_file())
        .collect();
    candidates.sort();

    let mut loaded = vec![];
    for path in candidates {
        let manifest = ExtensionManifest::load(&path)?;
        if config.is_disabled(&manifest.name) {
            tracing::info!(extension = %manifest.name, "skipping disabled extension");
            continue;
        }
        loaded.push(ScriptedExtension::load(&path, &config.script)?);
    }

    tracing::debug!(dir = %dir.display(), count = loaded.len(), "extension discovery finished");
    Ok(loaded)
}
