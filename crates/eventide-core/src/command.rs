//! Command records.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::event::Payload;
use crate::serializer::JsonSerializer;

/// A command that has not been queued yet.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandData {
    /// Command type name, used for routing.
    pub command_type: String,
    /// Serialized payload.
    pub payload: Payload,
}

impl CommandData {
    /// Creates command data from already-serialized bytes.
    #[must_use]
    pub fn new(command_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            command_type: command_type.into(),
            payload: Payload::from_bytes(payload),
        }
    }

    /// Creates command data with a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if `value` cannot be encoded.
    pub fn json<T>(command_type: impl Into<String>, value: &T) -> Result<Self>
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        Ok(Self {
            command_type: command_type.into(),
            payload: Payload::encode_with(value, &JsonSerializer)?,
        })
    }
}

/// A queued command.
#[derive(Debug, Clone)]
pub struct Command {
    /// Monotonic id; equals commit order.
    pub id: i64,
    /// Who queued the command, e.g. `process.transfer` or an API name.
    pub source: String,
    /// When the command was queued.
    pub executed_at: DateTime<Utc>,
    /// Set exactly once, when the command has been handled.
    pub handled_at: Option<DateTime<Utc>>,
    /// Type and payload.
    pub data: CommandData,
}

impl Command {
    /// The command type name.
    #[must_use]
    pub fn command_type(&self) -> &str {
        &self.data.command_type
    }

    /// The serialized payload.
    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.data.payload
    }
}
