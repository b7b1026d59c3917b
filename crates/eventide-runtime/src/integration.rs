//! Integrations: stateless command-to-event translation.

use async_trait::async_trait;
use eventide_core::{CommandData, Context, EventData, Result};
use eventide_store::append_events_unchecked;
use eventide_store::schema::INTEGRATION_STREAM_TYPE;
use sqlx::postgres::PgConnection;
use tracing::debug;

use crate::check_declared;
use crate::command_handler::CommandTarget;

/// Translates commands into events without state or concurrency control,
/// typically to record the outcome of an external call.
#[async_trait]
pub trait Integration: Send + Sync {
    /// Unique integration name; also the instance of its stream.
    fn name(&self) -> &str;

    /// Command types this integration handles.
    fn command_types(&self) -> &[&str];

    /// Event types this integration may record.
    fn event_types(&self) -> &[&str];

    /// Performs the command.
    ///
    /// # Errors
    ///
    /// Returns `Error::Handler` to reject the command.
    async fn handle_command(&self, scope: &mut IntegrationScope<'_, Self>) -> Result<()>;
}

/// What an integration's command handler sees and may do.
pub struct IntegrationScope<'a, I: Integration + ?Sized> {
    integration: &'a I,
    command: &'a CommandData,
    recorded: Vec<EventData>,
}

impl<I: Integration + ?Sized> IntegrationScope<'_, I> {
    /// The command being handled.
    #[must_use]
    pub fn command(&self) -> &CommandData {
        self.command
    }

    /// Queues `event` for appending.
    ///
    /// # Errors
    ///
    /// Returns `Error::Undeclared` if the integration does not declare the
    /// event type.
    pub fn record_event(&mut self, event: EventData) -> Result<()> {
        check_declared(
            "event",
            self.integration.event_types(),
            &event.event_type,
            &format!("integration {}", self.integration.name()),
        )?;
        self.recorded.push(event);
        Ok(())
    }

    /// Events recorded so far.
    #[must_use]
    pub fn recorded_events(&self) -> &[EventData] {
        &self.recorded
    }
}

/// Drives an [`Integration`] against the event store.
#[derive(Debug)]
pub struct IntegrationRuntime<I> {
    integration: I,
}

impl<I: Integration> IntegrationRuntime<I> {
    /// Wraps `integration`.
    pub fn new(integration: I) -> Self {
        Self { integration }
    }

    /// The wrapped integration.
    pub fn integration(&self) -> &I {
        &self.integration
    }
}

#[async_trait]
impl<I> CommandTarget for IntegrationRuntime<I>
where
    I: Integration + 'static,
{
    fn name(&self) -> &str {
        self.integration.name()
    }

    fn command_types(&self) -> &[&str] {
        self.integration.command_types()
    }

    async fn handle_command(
        &self,
        ctx: &Context,
        conn: &mut PgConnection,
        command: &CommandData,
    ) -> Result<bool> {
        let integration = &self.integration;
        let mut scope = IntegrationScope {
            integration,
            command,
            recorded: Vec::new(),
        };
        ctx.run(integration.handle_command(&mut scope)).await?;
        let events = scope.recorded;

        if !events.is_empty() {
            append_events_unchecked(ctx, conn, INTEGRATION_STREAM_TYPE, integration.name(), &events)
                .await?;
        }
        debug!(integration = integration.name(), count = events.len(), "command handled");
        Ok(true)
    }
}
