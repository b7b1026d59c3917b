//! Command routing and the command-queue maintainer.
//!
//! Command handling is globally linearized: a single advisory lock makes
//! exactly one worker active, and that worker handles queued commands one
//! at a time in id order. Each command is marked handled and dispatched in
//! one transaction, so a failure leaves it queued.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use eventide_core::{Command, CommandData, Context, Error, Result};
use eventide_store::schema::COMMANDS_CHANNEL;
use eventide_store::{
    AdvisoryLock, PollOptions, begin_transaction, mark_command_handled,
    read_unhandled_commands_continuously, with_advisory_lock,
};
use sqlx::PgPool;
use sqlx::postgres::PgConnection;
use tracing::{debug, info, warn};

use crate::aggregate::{Aggregate, AggregateRuntime};
use crate::config::WorkerConfig;
use crate::integration::{Integration, IntegrationRuntime};
use crate::{Lifecycle, MaintainerState};

/// Something commands can be dispatched to.
#[async_trait]
pub trait CommandTarget: Send + Sync {
    /// Name used in logs and routing errors.
    fn name(&self) -> &str;

    /// Command types routed to this target.
    fn command_types(&self) -> &[&str];

    /// Handles `command` on `conn`, typically inside the caller's
    /// transaction. Returns `false` if an optimistic concurrency check was
    /// lost and nothing was written.
    ///
    /// # Errors
    ///
    /// Returns routing, handler, database or done errors.
    async fn handle_command(
        &self,
        ctx: &Context,
        conn: &mut PgConnection,
        command: &CommandData,
    ) -> Result<bool>;
}

/// A command-handling role registered with a [`CommandHandler`].
#[derive(Clone)]
pub enum CommandModule {
    /// An [`Aggregate`] behind its runtime.
    Aggregate(Arc<dyn CommandTarget>),
    /// An [`Integration`] behind its runtime.
    Integration(Arc<dyn CommandTarget>),
}

impl CommandModule {
    /// Registers an aggregate.
    pub fn aggregate<A: Aggregate + 'static>(aggregate: A) -> Self {
        Self::Aggregate(Arc::new(AggregateRuntime::new(aggregate)))
    }

    /// Registers an integration.
    pub fn integration<I: Integration + 'static>(integration: I) -> Self {
        Self::Integration(Arc::new(IntegrationRuntime::new(integration)))
    }

    fn target(&self) -> &Arc<dyn CommandTarget> {
        match self {
            Self::Aggregate(target) | Self::Integration(target) => target,
        }
    }

    fn label(&self) -> String {
        match self {
            Self::Aggregate(target) => format!("aggregate {}", target.name()),
            Self::Integration(target) => format!("integration {}", target.name()),
        }
    }
}

impl fmt::Debug for CommandModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

struct Route {
    label: String,
    target: Arc<dyn CommandTarget>,
}

/// Routes commands by type to the aggregate or integration declaring it.
pub struct CommandHandler {
    routes: HashMap<String, Route>,
}

impl CommandHandler {
    /// Builds the routing table.
    ///
    /// # Errors
    ///
    /// Returns `Error::DuplicateRoute` if two modules declare the same
    /// command type.
    pub fn new(modules: impl IntoIterator<Item = CommandModule>) -> Result<Self> {
        let mut routes: HashMap<String, Route> = HashMap::new();
        for module in modules {
            let label = module.label();
            let target = module.target();
            for &command_type in target.command_types() {
                if let Some(existing) = routes.get(command_type) {
                    return Err(Error::DuplicateRoute {
                        command_type: command_type.to_owned(),
                        first: existing.label.clone(),
                        second: label,
                    });
                }
                routes.insert(
                    command_type.to_owned(),
                    Route {
                        label: label.clone(),
                        target: Arc::clone(target),
                    },
                );
            }
        }
        Ok(Self { routes })
    }

    /// Label of the module `command_type` routes to, e.g.
    /// `aggregate account`.
    #[must_use]
    pub fn route_of(&self, command_type: &str) -> Option<&str> {
        self.routes.get(command_type).map(|route| route.label.as_str())
    }

    /// Dispatches `command` on `conn`. Returns `false` if the target lost
    /// an optimistic concurrency race and wrote nothing.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoRoute` for an unknown command type, or whatever the
    /// target fails with.
    pub async fn handle_command(
        &self,
        ctx: &Context,
        conn: &mut PgConnection,
        command: &CommandData,
    ) -> Result<bool> {
        let route = self
            .routes
            .get(&command.command_type)
            .ok_or_else(|| Error::NoRoute {
                command_type: command.command_type.clone(),
            })?;
        debug!(command_type = %command.command_type, target = %route.label, "dispatching command");
        route.target.handle_command(ctx, conn, command).await
    }
}

impl fmt::Debug for CommandHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.routes.iter().map(|(command_type, route)| (command_type, &route.label)))
            .finish()
    }
}

const LOCK_STARTUP: [MaintainerState; 2] = [
    MaintainerState::AcquiringConnection,
    MaintainerState::AcquiringLock,
];

/// Drains the command queue until `ctx` is done or a command fails.
///
/// Blocks while another worker holds the command-handler lock. A handler
/// error rolls back that command's transaction and ends the loop; the
/// command stays queued.
///
/// # Errors
///
/// Returns the context's done error on shutdown, or the first failure.
pub async fn maintain_command_handler(
    ctx: &Context,
    pool: &PgPool,
    config: &WorkerConfig,
    handler: &CommandHandler,
) -> Result<()> {
    let mut lifecycle = Lifecycle::new("command_handler");
    // with_advisory_lock takes a connection, then waits for the lock.
    for state in LOCK_STARTUP {
        lifecycle.enter(state);
    }
    let result = with_advisory_lock(ctx, pool, AdvisoryLock::command_handler(), |scope| {
        let lifecycle = &mut lifecycle;
        async move {
            lifecycle.enter(MaintainerState::Streaming);
            let options = PollOptions::new(COMMANDS_CHANNEL, config.idle_timeout);
            read_unhandled_commands_continuously(&scope, pool, &options, 0, |command| {
                handle_queued(&scope, pool, handler, command)
            })
            .await
        }
    })
    .await;
    lifecycle.finish(&result);
    result
}

async fn handle_queued(
    ctx: &Context,
    pool: &PgPool,
    handler: &CommandHandler,
    command: Command,
) -> Result<bool> {
    let mut tx = begin_transaction(ctx, pool).await?;
    if !mark_command_handled(ctx, &mut tx, command.id).await? {
        debug!(command_id = command.id, "command already handled, skipping");
        return Ok(true);
    }

    let mut attempt = 1_u32;
    while !handler.handle_command(ctx, &mut tx, &command.data).await? {
        warn!(command_id = command.id, attempt, "optimistic concurrency conflict, retrying");
        attempt += 1;
    }
    ctx.run(async { Ok::<_, Error>(tx.commit().await?) }).await?;

    info!(
        command_id = command.id,
        command_type = %command.data.command_type,
        source = %command.source,
        "command handled"
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_startup_takes_a_connection_before_the_lock() {
        assert_eq!(
            LOCK_STARTUP,
            [MaintainerState::AcquiringConnection, MaintainerState::AcquiringLock]
        );
    }
}
