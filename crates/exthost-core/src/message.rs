//! Instance identifiers and message envelopes.

use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Opaque identifier of one attached script context.
///
/// Ids are handed out by the host and are only meaningful between the
/// instance-created and instance-destroyed events that surround them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u32);

impl InstanceId {
    /// Create a new instance id.
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw id.
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for InstanceId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// How a message travels between a script context and an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageKind {
    /// Pushed without waiting for an answer.
    Async,
    /// Blocks the caller until a reply string is produced.
    Sync,
}

/// A message payload together with its routing information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Instance the message belongs to.
    pub instance: InstanceId,
    /// Delivery kind.
    pub kind: MessageKind,
    /// Untyped payload.
    pub payload: String,
    /// When the envelope was created.
    pub at: DateTime<Local>,
}

impl Envelope {
    /// Create an envelope stamped with the current time.
    pub fn new(instance: InstanceId, kind: MessageKind, payload: impl Into<String>) -> Self {
        Self {
            instance,
            kind,
            payload: payload.into(),
            at: Local::now(),
        }
    }

    /// Create an async envelope.
    pub fn post(instance: InstanceId, payload: impl Into<String>) -> Self {
        Self::new(instance, MessageKind::Async, payload)
    }

    /// Create a sync envelope.
    pub fn sync(instance: InstanceId, payload: impl Into<String>) -> Self {
        Self::new(instance, MessageKind::Sync, payload)
    }
}
