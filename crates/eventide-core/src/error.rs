//! Runtime error types.

use thiserror::Error;

use crate::context::DoneCause;

/// Boxed error raised by domain callbacks and serializers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Convenience alias used across the eventide crates.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    /// The bound context was canceled.
    #[error("operation canceled")]
    Canceled,

    /// The bound context timed out.
    #[error("operation timed out")]
    TimedOut,

    /// The caller passed invalid arguments. Never retried.
    #[error("usage error: {0}")]
    Usage(String),

    /// A handler recorded an event or executed a command it did not declare.
    #[error("{kind} type {type_name:?} is not declared by {module}")]
    Undeclared {
        /// `"event"` or `"command"`.
        kind: &'static str,
        /// The offending type name.
        type_name: String,
        /// The module that tried to emit it.
        module: String,
    },

    /// No handler accepts the command.
    #[error("no suitable route for command {command_type:?}")]
    NoRoute {
        /// The command type that could not be routed.
        command_type: String,
    },

    /// Two command handlers claim the same command type.
    #[error("command type {command_type:?} is claimed by both {first} and {second}")]
    DuplicateRoute {
        /// The contested command type.
        command_type: String,
        /// The handler registered first.
        first: String,
        /// The handler registered second.
        second: String,
    },

    /// A domain callback failed.
    #[error("handler error: {0}")]
    Handler(#[source] BoxError),

    /// A payload or state value could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[source] BoxError),

    /// The database reported an error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Error {
    /// Wraps a domain failure.
    pub fn handler(err: impl Into<BoxError>) -> Self {
        Self::Handler(err.into())
    }

    /// Wraps a serializer failure.
    pub fn serialization(err: impl Into<BoxError>) -> Self {
        Self::Serialization(err.into())
    }

    /// Returns `true` if the error reports a finished context rather than a
    /// failure.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Canceled | Self::TimedOut)
    }
}

impl From<DoneCause> for Error {
    fn from(cause: DoneCause) -> Self {
        match cause {
            DoneCause::Canceled => Self::Canceled,
            DoneCause::TimedOut => Self::TimedOut,
        }
    }
}
