//! Pluggable payload and state serialization.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Converts values of `T` to and from bytes, and produces independent copies
/// of them.
pub trait Serializer<T>: Send + Sync {
    /// Encodes `value`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if the value cannot be encoded.
    fn serialize(&self, value: &T) -> Result<Vec<u8>>;

    /// Decodes a value from `bytes`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if the bytes are not a valid `T`.
    fn deserialize(&self, bytes: &[u8]) -> Result<T>;

    /// Returns a copy of `value` that shares nothing mutable with it.
    fn copy(&self, value: &T) -> T;
}

/// JSON serialization via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl<T> Serializer<T> for JsonSerializer
where
    T: Serialize + DeserializeOwned + Clone,
{
    fn serialize(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(Error::serialization)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(Error::serialization)
    }

    fn copy(&self, value: &T) -> T {
        value.clone()
    }
}
