//! Direct table inspection for assertions.

use sqlx::PgPool;

/// Next offset of a stream, or `None` if the stream does not exist.
///
/// # Panics
///
/// Panics on database errors.
pub async fn stream_next(pool: &PgPool, stream_type: &str, instance: &str) -> Option<i64> {
    sqlx::query_scalar("SELECT next FROM streams WHERE type = $1 AND instance = $2")
        .bind(stream_type)
        .bind(instance)
        .fetch_optional(pool)
        .await
        .expect("stream lookup failed")
}

/// All global offsets in ascending order.
///
/// # Panics
///
/// Panics on database errors.
pub async fn global_offsets(pool: &PgPool) -> Vec<i64> {
    sqlx::query_scalar("SELECT global_offset FROM events ORDER BY global_offset")
        .fetch_all(pool)
        .await
        .expect("global offset lookup failed")
}

/// Next offset of a checkpoint, or `None` if it was never created.
///
/// # Panics
///
/// Panics on database errors.
pub async fn checkpoint_next(pool: &PgPool, checkpoint_type: &str) -> Option<i64> {
    sqlx::query_scalar("SELECT next FROM checkpoints WHERE type = $1")
        .bind(checkpoint_type)
        .fetch_optional(pool)
        .await
        .expect("checkpoint lookup failed")
}

/// Number of queued commands, handled or not.
///
/// # Panics
///
/// Panics on database errors.
pub async fn command_count(pool: &PgPool) -> i64 {
    sqlx::query_scalar("SELECT count(*) FROM commands")
        .fetch_one(pool)
        .await
        .expect("command count failed")
}

/// Ids of commands not yet handled, ascending.
///
/// # Panics
///
/// Panics on database errors.
pub async fn unhandled_command_ids(pool: &PgPool) -> Vec<i64> {
    sqlx::query_scalar("SELECT id FROM commands WHERE handled_at IS NULL ORDER BY id")
        .fetch_all(pool)
        .await
        .expect("unhandled command lookup failed")
}

/// Appends one event the way the store does, but without sending a
/// notification, so only the idle timer can discover it.
///
/// # Panics
///
/// Panics on database errors.
pub async fn insert_event_silently(
    pool: &PgPool,
    stream_type: &str,
    instance: &str,
    event_type: &str,
    payload: &[u8],
) {
    let mut tx = pool.begin().await.expect("begin failed");
    let (stream_id, stream_offset): (i64, i64) = sqlx::query_as(
        "INSERT INTO streams (type, instance, next) VALUES ($1, $2, 1) \
         ON CONFLICT (type, instance) DO UPDATE SET next = streams.next + 1 \
         RETURNING id, next - 1",
    )
    .bind(stream_type)
    .bind(instance)
    .fetch_one(&mut *tx)
    .await
    .expect("stream upsert failed");
    let global_offset: i64 =
        sqlx::query_scalar("UPDATE global_offset SET next = next + 1 RETURNING next - 1")
            .fetch_one(&mut *tx)
            .await
            .expect("global offset bump failed");
    sqlx::query(
        "INSERT INTO events (global_offset, type, stream_id, stream_offset, payload) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(global_offset)
    .bind(event_type)
    .bind(stream_id)
    .bind(stream_offset)
    .bind(payload)
    .execute(&mut *tx)
    .await
    .expect("event insert failed");
    tx.commit().await.expect("commit failed");
}
