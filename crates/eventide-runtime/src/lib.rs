//! Eventide Runtime: the four execution roles and their maintainers.
//!
//! Aggregates and integrations turn commands into events and are driven by
//! the [`CommandHandler`]. Processes and projections consume the global event
//! order behind a checkpoint and are driven by [`maintain_process`] and
//! [`maintain_projection`].

use std::fmt;

use eventide_core::{Error, Result};
use tracing::{error, info};

pub mod aggregate;
mod checkpointed;
pub mod command_handler;
pub mod config;
pub mod integration;
pub mod process;
pub mod projection;
pub mod telemetry;

pub use aggregate::{Aggregate, AggregateRuntime, AggregateScope};
pub use command_handler::{CommandHandler, CommandModule, CommandTarget, maintain_command_handler};
pub use config::{ConfigError, WorkerConfig};
pub use integration::{Integration, IntegrationRuntime, IntegrationScope};
pub use process::{Process, ProcessRuntime, ProcessScope, maintain_process};
pub use projection::{Projection, maintain_projection};

/// Lifecycle of a maintainer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintainerState {
    /// Not started.
    Idle,
    /// Borrowing a connection to set up the role.
    AcquiringConnection,
    /// Waiting to become the single active worker for the role.
    AcquiringLock,
    /// Consuming the log.
    Streaming,
    /// The context finished.
    Cancelled,
    /// A failure ended the loop.
    Errored,
    /// The consumer asked to stop.
    Stopped,
}

impl fmt::Display for MaintainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::AcquiringConnection => "acquiring_connection",
            Self::AcquiringLock => "acquiring_lock",
            Self::Streaming => "streaming",
            Self::Cancelled => "cancelled",
            Self::Errored => "errored",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

impl MaintainerState {
    /// The terminal state a maintainer ends in for `result`.
    #[must_use]
    pub fn terminal<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::Stopped,
            Err(err) if err.is_done() => Self::Cancelled,
            Err(_) => Self::Errored,
        }
    }
}

/// Tracks and logs the state transitions of one maintainer.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    role: String,
    state: MaintainerState,
}

impl Lifecycle {
    pub(crate) fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            state: MaintainerState::Idle,
        }
    }

    pub(crate) fn enter(&mut self, next: MaintainerState) {
        info!(role = %self.role, from = %self.state, to = %next, "maintainer state changed");
        self.state = next;
    }

    pub(crate) fn finish<T>(&mut self, result: &Result<T>) {
        let next = MaintainerState::terminal(result);
        if let (Err(err), MaintainerState::Errored) = (result, next) {
            error!(role = %self.role, error = %err, "maintainer failed");
        }
        self.enter(next);
    }
}

/// Rejects a type a handler did not declare.
pub(crate) fn check_declared(
    kind: &'static str,
    declared: &[&str],
    type_name: &str,
    module: &str,
) -> Result<()> {
    if declared.contains(&type_name) {
        Ok(())
    } else {
        Err(Error::Undeclared {
            kind,
            type_name: type_name.to_owned(),
            module: module.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_state_distinguishes_cancellation_from_failure() {
        assert_eq!(MaintainerState::terminal(&Ok(())), MaintainerState::Stopped);
        assert_eq!(
            MaintainerState::terminal::<()>(&Err(Error::TimedOut)),
            MaintainerState::Cancelled
        );
        assert_eq!(
            MaintainerState::terminal::<()>(&Err(Error::handler("boom"))),
            MaintainerState::Errored
        );
    }

    #[test]
    fn test_check_declared_rejects_unknown_type() {
        let declared = ["opened", "closed"];

        assert!(check_declared("event", &declared, "opened", "aggregate account").is_ok());
        let err = check_declared("event", &declared, "frozen", "aggregate account").unwrap_err();

        assert_eq!(
            err.to_string(),
            "event type \"frozen\" is not declared by aggregate account"
        );
    }

    #[test]
    fn test_state_display_is_snake_case() {
        assert_eq!(MaintainerState::AcquiringLock.to_string(), "acquiring_lock");
    }
}
