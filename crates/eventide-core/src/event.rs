//! Event records and memoized payloads.

use std::any::Any;
use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::serializer::{JsonSerializer, Serializer};

/// Serialized payload bytes with a one-shot decoded value.
///
/// The first successful [`decode_with`](Payload::decode_with) stores the
/// decoded value; later calls return it without touching the bytes again.
pub struct Payload {
    bytes: Vec<u8>,
    decoded: OnceLock<Box<dyn Any + Send + Sync>>,
}

impl Payload {
    /// Wraps already-serialized bytes.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            decoded: OnceLock::new(),
        }
    }

    /// Serializes `value` with `serializer`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if encoding fails.
    pub fn encode_with<T, S>(value: &T, serializer: &S) -> Result<Self>
    where
        S: Serializer<T> + ?Sized,
    {
        serializer.serialize(value).map(Self::from_bytes)
    }

    /// The raw serialized bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Decodes the payload as `T`, memoizing the result.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if decoding fails, or `Error::Usage` if
    /// the payload was already decoded as a different type.
    pub fn decode_with<T, S>(&self, serializer: &S) -> Result<&T>
    where
        T: Any + Send + Sync,
        S: Serializer<T> + ?Sized,
    {
        if self.decoded.get().is_none() {
            let value = serializer.deserialize(&self.bytes)?;
            // A concurrent decode may have won; both produced the same value.
            let _ = self.decoded.set(Box::new(value));
        }
        self.decoded
            .get()
            .and_then(|value| value.downcast_ref::<T>())
            .ok_or_else(|| {
                Error::Usage(format!(
                    "payload already decoded as a type other than {}",
                    std::any::type_name::<T>()
                ))
            })
    }

    /// Decodes the payload as JSON.
    ///
    /// # Errors
    ///
    /// See [`decode_with`](Payload::decode_with).
    pub fn decode<T>(&self) -> Result<&T>
    where
        T: Serialize + DeserializeOwned + Clone + Any + Send + Sync,
    {
        self.decode_with(&JsonSerializer)
    }
}

impl Clone for Payload {
    fn clone(&self) -> Self {
        Self::from_bytes(self.bytes.clone())
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("len", &self.bytes.len())
            .field("decoded", &self.decoded.get().is_some())
            .finish()
    }
}

/// An event that has not been written yet.
#[derive(Debug, Clone, PartialEq)]
pub struct EventData {
    /// Event type name, checked against the emitter's declared types.
    pub event_type: String,
    /// Serialized payload.
    pub payload: Payload,
}

impl EventData {
    /// Creates event data from already-serialized bytes.
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            event_type: event_type.into(),
            payload: Payload::from_bytes(payload),
        }
    }

    /// Creates event data with a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if `value` cannot be encoded.
    pub fn json<T>(event_type: impl Into<String>, value: &T) -> Result<Self>
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        Ok(Self {
            event_type: event_type.into(),
            payload: Payload::encode_with(value, &JsonSerializer)?,
        })
    }
}

/// An event read back from the store.
#[derive(Debug, Clone)]
pub struct Event {
    /// Position in the total order across all streams. Gapless from 0.
    pub global_offset: i64,
    /// Owning stream row id.
    pub stream_id: i64,
    /// Owning stream type, e.g. `aggregate.account`.
    pub stream_type: String,
    /// Owning stream instance key.
    pub stream_instance: String,
    /// Position within the owning stream. Contiguous from 0.
    pub stream_offset: i64,
    /// Commit timestamp.
    pub time: DateTime<Utc>,
    /// Type and payload.
    pub data: EventData,
}

impl Event {
    /// The event type name.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.data.event_type
    }

    /// The serialized payload.
    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.data.payload
    }
}
