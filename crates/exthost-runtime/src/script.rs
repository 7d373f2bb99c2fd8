//! Shared Rhai engine setup.

use exthost_core::{HostError, InstanceId, ScriptLimits};
use rhai::{Dynamic, Engine, EvalAltResult, INT};

/// Create an engine with the host's limits and logging functions.
pub(crate) fn new_engine(limits: &ScriptLimits) -> Engine {
    let mut engine = Engine::new();

    // Configure safety limits
    engine.set_max_expr_depths(limits.max_expr_depth, limits.max_expr_depth);
    engine.set_max_call_levels(limits.max_call_levels);
    engine.set_max_operations(limits.max_operations);
    engine.set_max_modules(16);
    engine.set_max_string_size(limits.max_string_size);
    engine.set_max_array_size(10_000);
    engine.set_max_map_size(10_000);

    engine.on_print(|text| tracing::info!(target: "script", "{}", text));
    engine.on_debug(|text, source, _pos| {
        tracing::debug!(target: "script", source = source.unwrap_or("-"), "{}", text);
    });

    engine.register_fn("log_info", |msg: &str| {
        tracing::info!(target: "script", "{}", msg);
    });
    engine.register_fn("log_warn", |msg: &str| {
        tracing::warn!(target: "script", "{}", msg);
    });
    engine.register_fn("log_error", |msg: &str| {
        tracing::error!(target: "script", "{}", msg);
    });
    engine.register_fn("now", exthost_core::timestamp_now);

    engine
}

/// Turn a host error into a script runtime error.
pub(crate) fn host_error(err: HostError) -> Box<EvalAltResult> {
    err.to_string().into()
}

/// Convert a script integer into an instance id.
pub(crate) fn instance_id(value: INT) -> Result<InstanceId, Box<EvalAltResult>> {
    u32::try_from(value)
        .map(InstanceId::new)
        .map_err(|_| format!("invalid instance id: {value}").into())
}

/// Convert an instance id into a script integer.
pub(crate) fn instance_int(instance: InstanceId) -> INT {
    INT::from(instance.get())
}

/// Interpret a script return value as an optional reply string.
pub(crate) fn reply_text(value: Dynamic) -> Option<String> {
    if value.is_unit() {
        None
    } else if value.is_string() {
        value.into_string().ok()
    } else {
        Some(value.to_string())
    }
}
