//! Payload builders.

use eventide_core::{CommandData, EventData};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Builds an event whose payload is `value` encoded as JSON.
///
/// # Panics
///
/// Panics if `value` cannot be encoded.
#[must_use]
pub fn json_event<T: Serialize + DeserializeOwned + Clone>(event_type: &str, value: &T) -> EventData {
    EventData::json(event_type, value).expect("test event payload must encode")
}

/// Builds a command whose payload is `value` encoded as JSON.
///
/// # Panics
///
/// Panics if `value` cannot be encoded.
#[must_use]
pub fn json_command<T: Serialize + DeserializeOwned + Clone>(command_type: &str, value: &T) -> CommandData {
    CommandData::json(command_type, value).expect("test command payload must encode")
}
