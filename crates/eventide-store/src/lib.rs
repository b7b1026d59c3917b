//! Eventide Store: PostgreSQL persistence and coordination.
//!
//! Row streaming, hybrid poll/notify consumption, advisory locks, and the
//! append-only event and command logs with their optimistic concurrency
//! checks.

pub mod checkpoint;
pub mod command_store;
pub mod continuous;
pub mod event_store;
pub mod lock;
pub mod process_state;
pub mod query;
pub mod schema;

pub use checkpoint::{Checkpoint, advance_checkpoint, ensure_checkpoint, read_checkpoint};
pub use command_store::{
    execute_commands, mark_command_handled, read_commands, read_unhandled_commands_continuously,
};
pub use continuous::{PollOptions, consume_continuously};
pub use event_store::{
    append_events, append_events_unchecked, read_events, read_events_by_stream,
    read_events_continuously,
};
pub use lock::{AdvisoryLock, with_advisory_lock};
pub use process_state::{load_process_state, save_process_state};
pub use query::{acquire_connection, begin_transaction, consume_query};
