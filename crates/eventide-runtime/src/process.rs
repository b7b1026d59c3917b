//! Processes: checkpointed event handlers that keep durable per-instance
//! state and emit commands.

use async_trait::async_trait;
use eventide_core::{CommandData, Context, Event, Result, Serializer, StateController};
use eventide_store::schema::process_checkpoint_type;
use eventide_store::{execute_commands, load_process_state, save_process_state};
use futures::FutureExt;
use sqlx::PgPool;
use sqlx::postgres::PgConnection;
use tracing::debug;

use crate::check_declared;
use crate::checkpointed::{CheckpointHandler, maintain_checkpointed};
use crate::config::WorkerConfig;

/// An event-driven orchestrator (saga).
#[async_trait]
pub trait Process: Send + Sync {
    /// Durable state of one instance.
    type State: Send + Sync;

    /// Unique process name. Its checkpoint and the source of the commands it
    /// executes are `process.<name>`.
    fn name(&self) -> &str;

    /// Command types this process may execute.
    fn command_types(&self) -> &[&str];

    /// Picks the instance an event belongs to. `None` skips the event.
    fn route_event(&self, event: &Event) -> Option<String>;

    /// State of an instance that has never been saved.
    fn create_initial_state(&self) -> Self::State;

    /// Encodes, decodes and copies the state.
    fn state_serializer(&self) -> &dyn Serializer<Self::State>;

    /// Reacts to one routed event.
    ///
    /// # Errors
    ///
    /// Any error rolls the event back and stops the maintainer.
    async fn handle_event(&self, scope: &mut ProcessScope<'_, Self>) -> Result<()>;
}

/// What a process's event handler sees and may do.
///
/// The instance state is loaded from the database on first access only.
pub struct ProcessScope<'a, P: Process + ?Sized> {
    process: &'a P,
    event: &'a Event,
    instance: &'a str,
    state: StateController<'a, P::State>,
    commands: Vec<CommandData>,
}

impl<P: Process + ?Sized> ProcessScope<'_, P> {
    /// The event being handled.
    #[must_use]
    pub fn event(&self) -> &Event {
        self.event
    }

    /// The routed instance.
    #[must_use]
    pub fn instance(&self) -> &str {
        self.instance
    }

    /// A copy of the instance state.
    ///
    /// # Errors
    ///
    /// Returns loading or deserialization errors.
    pub async fn read_state(&mut self) -> Result<P::State> {
        self.state.read_state().await
    }

    /// Mutates a copy of the state; the result is saved with the event.
    ///
    /// # Errors
    ///
    /// Returns loading errors or the error of `update`, in which case the
    /// state is unchanged.
    pub async fn update_state<F>(&mut self, update: F) -> Result<()>
    where
        F: FnOnce(&mut P::State) -> Result<()> + Send,
    {
        self.state.update_state(update).await
    }

    /// Replaces the state with the value `produce` derives from a copy of it.
    ///
    /// # Errors
    ///
    /// Returns loading errors or the error of `produce`.
    pub async fn replace_state<F>(&mut self, produce: F) -> Result<()>
    where
        F: FnOnce(P::State) -> Result<P::State> + Send,
    {
        self.state.replace_state(produce).await
    }

    /// Overwrites the state without loading it.
    pub fn set_state(&mut self, state: P::State) {
        self.state.set_state(state);
    }

    /// Queues `command`; it is executed when the event commits.
    ///
    /// # Errors
    ///
    /// Returns `Error::Undeclared` if the process does not declare the
    /// command type.
    pub fn execute_command(&mut self, command: CommandData) -> Result<()> {
        check_declared(
            "command",
            self.process.command_types(),
            &command.command_type,
            &format!("process {}", self.process.name()),
        )?;
        self.commands.push(command);
        Ok(())
    }
}

/// Drives a [`Process`] against the store.
#[derive(Debug)]
pub struct ProcessRuntime<P> {
    process: P,
    role: String,
}

impl<P: Process> ProcessRuntime<P> {
    /// Wraps `process`.
    pub fn new(process: P) -> Self {
        let role = process_checkpoint_type(process.name());
        Self { process, role }
    }

    /// The wrapped process.
    pub fn process(&self) -> &P {
        &self.process
    }

    /// Handles one event on `conn`, normally inside the transaction that
    /// advances the checkpoint.
    ///
    /// Commands are queued and the state saved only for routed events, and
    /// the state only if the handler changed it.
    ///
    /// # Errors
    ///
    /// Returns handler, serialization, database or done errors.
    pub async fn handle_event(
        &self,
        ctx: &Context,
        conn: &mut PgConnection,
        event: &Event,
    ) -> Result<()> {
        let process = &self.process;
        let name = process.name();
        let Some(instance) = process.route_event(event) else {
            debug!(process = name, global_offset = event.global_offset, "event not routed");
            return Ok(());
        };

        let (state, commands) = {
            let instance = instance.as_str();
            let loader_conn = &mut *conn;
            let loader = move || {
                async move {
                    match load_process_state(ctx, loader_conn, name, instance).await? {
                        Some(bytes) => process.state_serializer().deserialize(&bytes),
                        None => Ok(process.create_initial_state()),
                    }
                }
                .boxed()
            };
            let mut scope = ProcessScope {
                process,
                event,
                instance,
                state: StateController::new(loader, move |state: &P::State| {
                    process.state_serializer().copy(state)
                }),
                commands: Vec::new(),
            };
            ctx.run(process.handle_event(&mut scope)).await?;
            (scope.state.into_updated(), scope.commands)
        };

        if !commands.is_empty() {
            let ids = execute_commands(ctx, conn, &self.role, &commands).await?;
            debug!(process = name, %instance, ?ids, "commands executed");
        }
        if let Some(state) = state {
            let bytes = process.state_serializer().serialize(&state)?;
            save_process_state(ctx, conn, name, &instance, &bytes).await?;
            debug!(process = name, %instance, "state saved");
        }
        Ok(())
    }
}

#[async_trait]
impl<P: Process> CheckpointHandler for ProcessRuntime<P> {
    async fn apply(&self, ctx: &Context, conn: &mut PgConnection, event: &Event) -> Result<()> {
        self.handle_event(ctx, conn, event).await
    }
}

/// Runs the process until `ctx` is done or handling an event fails.
///
/// Blocks while another worker maintains the same process.
///
/// # Errors
///
/// Returns the context's done error on shutdown, or the first failure.
pub async fn maintain_process<P: Process>(
    ctx: &Context,
    pool: &PgPool,
    config: &WorkerConfig,
    runtime: &ProcessRuntime<P>,
) -> Result<()> {
    maintain_checkpointed(ctx, pool, config, &runtime.role, runtime).await
}
