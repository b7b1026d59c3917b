//! Shared test fixtures and utilities for the eventide crates.

mod db;
mod fixtures;
mod wait;

pub use db::{
    checkpoint_next, command_count, global_offsets, insert_event_silently, stream_next,
    unhandled_command_ids,
};
pub use fixtures::{json_command, json_event};
pub use wait::wait_until;
