//! Names shared with the database schema in `migrations/`.

/// Notification channel published on every successful event append.
pub const EVENTS_CHANNEL: &str = "eventide_events";

/// Notification channel published whenever commands are queued.
pub const COMMANDS_CHANNEL: &str = "eventide_commands";

/// Advisory-lock namespace held by the single active command handler.
pub const LOCK_NAMESPACE_COMMAND_HANDLER: i32 = 0x4576_0001;

/// Advisory-lock namespace for checkpointed roles; the id is the checkpoint
/// row id.
pub const LOCK_NAMESPACE_CHECKPOINT: i32 = 0x4576_0002;

/// Transaction-scoped advisory-lock namespace serializing command inserts.
pub const LOCK_NAMESPACE_COMMAND_QUEUE: i32 = 0x4576_0003;

/// Stream type used for every integration's events; the instance is the
/// integration name.
pub const INTEGRATION_STREAM_TYPE: &str = "integration";

/// Stream type holding an aggregate's instances.
#[must_use]
pub fn aggregate_stream_type(aggregate: &str) -> String {
    format!("aggregate.{aggregate}")
}

/// Checkpoint type of a process role.
#[must_use]
pub fn process_checkpoint_type(process: &str) -> String {
    format!("process.{process}")
}

/// Checkpoint type of a projection role.
#[must_use]
pub fn projection_checkpoint_type(projection: &str) -> String {
    format!("projection.{projection}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_names_are_prefixed_by_kind() {
        assert_eq!(aggregate_stream_type("account"), "aggregate.account");
        assert_eq!(process_checkpoint_type("transfer"), "process.transfer");
        assert_eq!(projection_checkpoint_type("ledger"), "projection.ledger");
    }
}
