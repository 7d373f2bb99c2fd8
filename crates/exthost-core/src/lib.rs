//! Core types and traits for exthost.
//!
//! This crate provides the fundamental data structures shared by the host
//! runtime and the extensions it loads: instance identifiers, message
//! envelopes, timestamps, errors and host configuration.

mod config;
mod error;
mod message;
mod time;

pub use config::{HostConfig, HostConfigBuilder, ScriptLimits};
pub use error::{HostError, HostResult};
pub use message::{Envelope, InstanceId, MessageKind};
pub use time::{TIMESTAMP_FORMAT, format_timestamp, parse_timestamp, timestamp_now};
