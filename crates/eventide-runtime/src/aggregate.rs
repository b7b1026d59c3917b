//! Aggregates: command handlers with per-instance state folded from their
//! own event stream, guarded by optimistic concurrency.

use async_trait::async_trait;
use eventide_core::{CommandData, Context, Error, EventData, Result, StateController};
use eventide_store::schema::aggregate_stream_type;
use eventide_store::{append_events, read_events_by_stream};
use sqlx::postgres::PgConnection;
use tracing::debug;

use crate::check_declared;
use crate::command_handler::CommandTarget;

/// A command-handling entity whose state is the fold of its own events.
#[async_trait]
pub trait Aggregate: Send + Sync {
    /// Fold state of one instance.
    type State: Clone + Send + Sync;

    /// Unique aggregate name; events live on streams of type
    /// `aggregate.<name>`.
    fn name(&self) -> &str;

    /// Command types this aggregate handles.
    fn command_types(&self) -> &[&str];

    /// Event types this aggregate may record.
    fn event_types(&self) -> &[&str];

    /// Picks the instance a command targets. `None` means the command cannot
    /// be handled.
    fn route_command(&self, command: &CommandData) -> Option<String>;

    /// State of an instance with no events.
    fn create_initial_state(&self) -> Self::State;

    /// Independent copy of a state handed out to handlers.
    fn copy_state(&self, state: &Self::State) -> Self::State {
        state.clone()
    }

    /// Folds one event into `state`.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be applied, e.g. its payload
    /// fails to decode.
    fn apply_event(&self, state: &mut Self::State, event: &EventData) -> Result<()>;

    /// Decides which events a command produces.
    ///
    /// # Errors
    ///
    /// Returns `Error::Handler` to reject the command.
    async fn handle_command(&self, scope: &mut AggregateScope<'_, Self>) -> Result<()>;
}

/// What an aggregate's command handler sees and may do.
pub struct AggregateScope<'a, A: Aggregate + ?Sized> {
    aggregate: &'a A,
    command: &'a CommandData,
    instance: &'a str,
    state: StateController<'a, A::State>,
    recorded: Vec<EventData>,
}

impl<A: Aggregate + ?Sized> AggregateScope<'_, A> {
    /// The command being handled.
    #[must_use]
    pub fn command(&self) -> &CommandData {
        self.command
    }

    /// The targeted instance.
    #[must_use]
    pub fn instance(&self) -> &str {
        self.instance
    }

    /// A copy of the current state, including events recorded so far.
    ///
    /// # Errors
    ///
    /// Never fails for aggregates; the signature matches the other roles.
    pub async fn read_state(&mut self) -> Result<A::State> {
        self.state.read_state().await
    }

    /// Folds `event` into the live state and queues it for appending.
    ///
    /// # Errors
    ///
    /// Returns `Error::Undeclared` if the aggregate does not declare the
    /// event type, or the error of [`Aggregate::apply_event`]. Nothing is
    /// recorded in either case.
    pub async fn record_event(&mut self, event: EventData) -> Result<()> {
        let aggregate = self.aggregate;
        check_declared(
            "event",
            aggregate.event_types(),
            &event.event_type,
            &format!("aggregate {}", aggregate.name()),
        )?;
        self.state
            .update_state(|state| aggregate.apply_event(state, &event))
            .await?;
        self.recorded.push(event);
        Ok(())
    }

    /// Records several events in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// See [`record_event`](Self::record_event).
    pub async fn record_events(&mut self, events: Vec<EventData>) -> Result<()> {
        for event in events {
            self.record_event(event).await?;
        }
        Ok(())
    }

    /// Events recorded so far.
    #[must_use]
    pub fn recorded_events(&self) -> &[EventData] {
        &self.recorded
    }
}

/// Drives an [`Aggregate`] against the event store.
#[derive(Debug)]
pub struct AggregateRuntime<A> {
    aggregate: A,
    stream_type: String,
}

impl<A: Aggregate> AggregateRuntime<A> {
    /// Wraps `aggregate`.
    pub fn new(aggregate: A) -> Self {
        let stream_type = aggregate_stream_type(aggregate.name());
        Self {
            aggregate,
            stream_type,
        }
    }

    /// The wrapped aggregate.
    pub fn aggregate(&self) -> &A {
        &self.aggregate
    }

    /// Rebuilds the state of `instance` from its stream. Also returns the
    /// stream's next offset, which a following append must expect.
    ///
    /// # Errors
    ///
    /// Returns database errors, the context's done error, or the error of
    /// [`Aggregate::apply_event`].
    pub async fn load_state(
        &self,
        ctx: &Context,
        conn: &mut PgConnection,
        instance: &str,
    ) -> Result<(A::State, i64)> {
        let aggregate = &self.aggregate;
        let mut state = aggregate.create_initial_state();
        let mut next = 0;
        read_events_by_stream(ctx, conn, &self.stream_type, instance, 0, |event| {
            let applied = aggregate.apply_event(&mut state, &event.data).map(|()| {
                next = event.stream_offset + 1;
                true
            });
            std::future::ready(applied)
        })
        .await?;
        Ok((state, next))
    }
}

#[async_trait]
impl<A> CommandTarget for AggregateRuntime<A>
where
    A: Aggregate + 'static,
{
    fn name(&self) -> &str {
        self.aggregate.name()
    }

    fn command_types(&self) -> &[&str] {
        self.aggregate.command_types()
    }

    async fn handle_command(
        &self,
        ctx: &Context,
        conn: &mut PgConnection,
        command: &CommandData,
    ) -> Result<bool> {
        let aggregate = &self.aggregate;
        let instance = aggregate
            .route_command(command)
            .ok_or_else(|| Error::NoRoute {
                command_type: command.command_type.clone(),
            })?;
        let (state, next) = self.load_state(ctx, conn, &instance).await?;

        let mut scope = AggregateScope {
            aggregate,
            command,
            instance: &instance,
            state: StateController::loaded(state, move |state: &A::State| {
                aggregate.copy_state(state)
            }),
            recorded: Vec::new(),
        };
        ctx.run(aggregate.handle_command(&mut scope)).await?;
        let events = scope.recorded;

        if events.is_empty() {
            debug!(aggregate = aggregate.name(), %instance, "command recorded no events");
            return Ok(true);
        }
        let appended = append_events(ctx, conn, &self.stream_type, &instance, next, &events).await?;
        if appended {
            debug!(
                aggregate = aggregate.name(),
                %instance,
                count = events.len(),
                "command handled"
            );
        } else {
            debug!(aggregate = aggregate.name(), %instance, next, "lost race for stream");
        }
        Ok(appended)
    }
}
