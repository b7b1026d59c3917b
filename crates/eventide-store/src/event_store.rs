//! `PostgreSQL` event store with per-stream optimistic concurrency and a
//! gapless global order.
//!
//! Appends reserve a contiguous block of global offsets by bumping the
//! single-row `global_offset` counter inside the appending transaction. The
//! counter row stays locked until commit, so offsets become visible in order
//! and never leave gaps.

use std::future::Future;

use chrono::{DateTime, Utc};
use eventide_core::{Context, Error, Event, EventData, Payload, Result};
use sqlx::postgres::{PgArguments, PgConnection};
use sqlx::query::QueryAs;
use sqlx::{Connection, PgPool, Postgres, QueryBuilder};
use tracing::debug;

use crate::continuous::{PollOptions, consume_continuously};
use crate::query::consume_query;
use crate::schema::EVENTS_CHANNEL;

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    global_offset: i64,
    event_type: String,
    stream_id: i64,
    stream_type: String,
    stream_instance: String,
    stream_offset: i64,
    payload: Vec<u8>,
    time: DateTime<Utc>,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Self {
            global_offset: row.global_offset,
            stream_id: row.stream_id,
            stream_type: row.stream_type,
            stream_instance: row.stream_instance,
            stream_offset: row.stream_offset,
            time: row.time,
            data: EventData {
                event_type: row.event_type,
                payload: Payload::from_bytes(row.payload),
            },
        }
    }
}

fn validate_stream(stream_type: &str, instance: &str) -> Result<()> {
    if stream_type.is_empty() {
        return Err(Error::Usage("stream type must not be empty".into()));
    }
    if instance.is_empty() {
        return Err(Error::Usage("stream instance must not be empty".into()));
    }
    Ok(())
}

fn event_count(events: &[EventData]) -> Result<i64> {
    i64::try_from(events.len()).map_err(|_| Error::Usage("too many events in one append".into()))
}

/// Appends `events` to the `(stream_type, instance)` stream if its next
/// offset is still `expected_next`.
///
/// An `expected_next` of 0 creates the stream. Returns `Ok(false)` when
/// another writer got there first: the stream already exists, or its next
/// offset moved on. Nothing is written in that case.
///
/// Appending no events writes nothing and only reports whether
/// `expected_next` is still current, 0 for a stream that does not exist.
///
/// Runs in its own transaction, nested as a savepoint when `conn` is already
/// inside one. Subscribers on [`EVENTS_CHANNEL`] are notified on commit.
///
/// # Errors
///
/// Returns `Error::Usage` for empty stream identifiers or a negative
/// `expected_next`, database errors, or the context's done error.
pub async fn append_events(
    ctx: &Context,
    conn: &mut PgConnection,
    stream_type: &str,
    instance: &str,
    expected_next: i64,
    events: &[EventData],
) -> Result<bool> {
    validate_stream(stream_type, instance)?;
    if expected_next < 0 {
        return Err(Error::Usage(format!(
            "expected next offset must not be negative, got {expected_next}"
        )));
    }
    ctx.run(append_checked(conn, stream_type, instance, expected_next, events))
        .await
}

async fn append_checked(
    conn: &mut PgConnection,
    stream_type: &str,
    instance: &str,
    expected_next: i64,
    events: &[EventData],
) -> Result<bool> {
    if events.is_empty() {
        let next: Option<i64> =
            sqlx::query_scalar("SELECT next FROM streams WHERE type = $1 AND instance = $2")
                .bind(stream_type)
                .bind(instance)
                .fetch_optional(&mut *conn)
                .await?;
        return Ok(next.unwrap_or(0) == expected_next);
    }

    let count = event_count(events)?;
    let mut tx = conn.begin().await?;

    // A stream row left at next = 0 still counts as empty.
    let stream_id: Option<i64> = if expected_next == 0 {
        sqlx::query_scalar(
            "INSERT INTO streams (type, instance, next) VALUES ($1, $2, $3) \
             ON CONFLICT (type, instance) DO UPDATE SET next = EXCLUDED.next \
             WHERE streams.next = 0 RETURNING id",
        )
        .bind(stream_type)
        .bind(instance)
        .bind(count)
        .fetch_optional(&mut *tx)
        .await?
    } else {
        sqlx::query_scalar(
            "UPDATE streams SET next = next + $4 \
             WHERE type = $1 AND instance = $2 AND next = $3 RETURNING id",
        )
        .bind(stream_type)
        .bind(instance)
        .bind(expected_next)
        .bind(count)
        .fetch_optional(&mut *tx)
        .await?
    };

    let Some(stream_id) = stream_id else {
        debug!(stream_type, instance, expected_next, "stream moved on, append rejected");
        return Ok(false);
    };

    insert_events(&mut tx, stream_id, expected_next, events).await?;
    tx.commit().await?;
    debug!(stream_type, instance, expected_next, count, "events appended");
    Ok(true)
}

/// Appends `events` to the end of the `(stream_type, instance)` stream
/// without checking its next offset. For writers that never compete, such
/// as integrations. Appending no events is a no-op.
///
/// # Errors
///
/// Returns `Error::Usage` for empty stream identifiers, database errors, or
/// the context's done error.
pub async fn append_events_unchecked(
    ctx: &Context,
    conn: &mut PgConnection,
    stream_type: &str,
    instance: &str,
    events: &[EventData],
) -> Result<()> {
    validate_stream(stream_type, instance)?;
    ctx.run(append_unchecked(conn, stream_type, instance, events))
        .await
}

async fn append_unchecked(
    conn: &mut PgConnection,
    stream_type: &str,
    instance: &str,
    events: &[EventData],
) -> Result<()> {
    if events.is_empty() {
        return Ok(());
    }
    let count = event_count(events)?;
    let mut tx = conn.begin().await?;

    let (stream_id, first_offset): (i64, i64) = sqlx::query_as(
        "INSERT INTO streams (type, instance, next) VALUES ($1, $2, $3) \
         ON CONFLICT (type, instance) DO UPDATE SET next = streams.next + EXCLUDED.next \
         RETURNING id, next - $3",
    )
    .bind(stream_type)
    .bind(instance)
    .bind(count)
    .fetch_one(&mut *tx)
    .await?;

    insert_events(&mut tx, stream_id, first_offset, events).await?;
    tx.commit().await?;
    debug!(stream_type, instance, first_offset, count, "events appended unchecked");
    Ok(())
}

async fn insert_events(
    conn: &mut PgConnection,
    stream_id: i64,
    first_stream_offset: i64,
    events: &[EventData],
) -> Result<()> {
    if events.is_empty() {
        return Ok(());
    }
    let count = event_count(events)?;

    let first_global: i64 =
        sqlx::query_scalar("UPDATE global_offset SET next = next + $1 RETURNING next - $1")
            .bind(count)
            .fetch_one(&mut *conn)
            .await?;

    let mut builder = QueryBuilder::<Postgres>::new(
        "INSERT INTO events (global_offset, type, stream_id, stream_offset, payload) ",
    );
    builder.push_values(
        (first_global..).zip(first_stream_offset..).zip(events),
        |mut row, ((global_offset, stream_offset), event)| {
            row.push_bind(global_offset)
                .push_bind(event.event_type.as_str())
                .push_bind(stream_id)
                .push_bind(stream_offset)
                .push_bind(event.payload.bytes());
        },
    );
    builder.build().execute(&mut *conn).await?;

    let last_global = first_global + count - 1;
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(EVENTS_CHANNEL)
        .bind(last_global.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Feeds the events of one stream, in stream order starting at
/// `from_offset`, into `on_event`. Returns `Ok(false)` if `on_event`
/// stopped early.
///
/// # Errors
///
/// Returns database errors, the context's done error, or `on_event`'s error.
pub async fn read_events_by_stream<F, Fut>(
    ctx: &Context,
    conn: &mut PgConnection,
    stream_type: &str,
    instance: &str,
    from_offset: i64,
    mut on_event: F,
) -> Result<bool>
where
    F: FnMut(Event) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    validate_stream(stream_type, instance)?;
    let query = sqlx::query_as::<_, EventRow>(
        "SELECT e.global_offset, e.type AS event_type, e.stream_id, \
                s.type AS stream_type, s.instance AS stream_instance, \
                e.stream_offset, e.payload, e.time \
         FROM events e JOIN streams s ON s.id = e.stream_id \
         WHERE s.type = $1 AND s.instance = $2 AND e.stream_offset >= $3 \
         ORDER BY e.stream_offset",
    )
    .bind(stream_type)
    .bind(instance)
    .bind(from_offset);
    consume_query(ctx, conn, query, |row| on_event(row.into())).await
}

fn events_from(from_global: i64) -> QueryAs<'static, Postgres, EventRow, PgArguments> {
    sqlx::query_as::<_, EventRow>(
        "SELECT e.global_offset, e.type AS event_type, e.stream_id, \
                s.type AS stream_type, s.instance AS stream_instance, \
                e.stream_offset, e.payload, e.time \
         FROM events e JOIN streams s ON s.id = e.stream_id \
         WHERE e.global_offset >= $1 \
         ORDER BY e.global_offset",
    )
    .bind(from_global)
}

/// Feeds every event, in global order starting at `from_global`, into
/// `on_event`. Returns `Ok(false)` if `on_event` stopped early.
///
/// # Errors
///
/// Returns database errors, the context's done error, or `on_event`'s error.
pub async fn read_events<F, Fut>(
    ctx: &Context,
    conn: &mut PgConnection,
    from_global: i64,
    mut on_event: F,
) -> Result<bool>
where
    F: FnMut(Event) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    consume_query(ctx, conn, events_from(from_global), |row| on_event(row.into())).await
}

/// Feeds every event, in global order starting at `from_global`, into
/// `on_event`, then keeps waiting for new ones. Returns once `on_event`
/// returns `false`.
///
/// # Errors
///
/// Returns database errors, the context's done error, or `on_event`'s error.
pub async fn read_events_continuously<F, Fut>(
    ctx: &Context,
    pool: &PgPool,
    options: &PollOptions,
    from_global: i64,
    mut on_event: F,
) -> Result<()>
where
    F: FnMut(Event) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    consume_continuously(
        ctx,
        pool,
        options,
        from_global,
        events_from,
        |row: &EventRow| row.global_offset + 1,
        |row| on_event(row.into()),
    )
    .await
}
