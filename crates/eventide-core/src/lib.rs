//! Eventide Core: shared runtime abstractions.
//!
//! This crate defines the cancellation context, the error type, the event and
//! command records, payload serialization and the state controller that the
//! store and runtime crates build on. It issues no SQL.

pub mod command;
pub mod context;
pub mod error;
pub mod event;
pub mod serializer;
pub mod state;

pub use command::{Command, CommandData};
pub use context::{Context, DoneCause};
pub use error::{BoxError, Error, Result};
pub use event::{Event, EventData, Payload};
pub use serializer::{JsonSerializer, Serializer};
pub use state::StateController;
