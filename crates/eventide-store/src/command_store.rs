//! `PostgreSQL` command queue.

use std::future::Future;

use chrono::{DateTime, Utc};
use eventide_core::{Command, CommandData, Context, Error, Payload, Result};
use sqlx::postgres::{PgArguments, PgConnection};
use sqlx::query::QueryAs;
use sqlx::{Connection, PgPool, Postgres, QueryBuilder};
use tracing::debug;

use crate::continuous::{PollOptions, consume_continuously};
use crate::query::consume_query;
use crate::schema::{COMMANDS_CHANNEL, LOCK_NAMESPACE_COMMAND_QUEUE};

#[derive(Debug, sqlx::FromRow)]
struct CommandRow {
    id: i64,
    source: String,
    command_type: String,
    payload: Vec<u8>,
    executed_at: DateTime<Utc>,
    handled_at: Option<DateTime<Utc>>,
}

impl From<CommandRow> for Command {
    fn from(row: CommandRow) -> Self {
        Self {
            id: row.id,
            source: row.source,
            executed_at: row.executed_at,
            handled_at: row.handled_at,
            data: CommandData {
                command_type: row.command_type,
                payload: Payload::from_bytes(row.payload),
            },
        }
    }
}

/// Queues `commands` on behalf of `source` and returns their ids in order.
///
/// Ids are drawn while holding a transaction-scoped advisory lock, so id
/// order equals commit order and a reader keyed by id never skips a command
/// that commits late. When `conn` is inside a transaction, the commands
/// become visible when that transaction commits. Subscribers on
/// [`COMMANDS_CHANNEL`] are notified on commit.
///
/// # Errors
///
/// Returns `Error::Usage` for an empty source, database errors, or the
/// context's done error.
pub async fn execute_commands(
    ctx: &Context,
    conn: &mut PgConnection,
    source: &str,
    commands: &[CommandData],
) -> Result<Vec<i64>> {
    if source.is_empty() {
        return Err(Error::Usage("command source must not be empty".into()));
    }
    if commands.is_empty() {
        return Ok(Vec::new());
    }
    ctx.run(insert_commands(conn, source, commands)).await
}

async fn insert_commands(
    conn: &mut PgConnection,
    source: &str,
    commands: &[CommandData],
) -> Result<Vec<i64>> {
    let mut tx = conn.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock($1, 0)")
        .bind(LOCK_NAMESPACE_COMMAND_QUEUE)
        .execute(&mut *tx)
        .await?;

    let mut builder = QueryBuilder::<Postgres>::new("INSERT INTO commands (source, type, payload) ");
    builder.push_values(commands, |mut row, command| {
        row.push_bind(source)
            .push_bind(command.command_type.as_str())
            .push_bind(command.payload.bytes());
    });
    builder.push(" RETURNING id");
    let ids: Vec<i64> = builder.build_query_scalar().fetch_all(&mut *tx).await?;

    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(COMMANDS_CHANNEL)
        .bind(source)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    debug!(source, count = ids.len(), "commands queued");
    Ok(ids)
}

/// Marks a command handled. Returns `false` if it already was.
///
/// # Errors
///
/// Returns database errors or the context's done error.
pub async fn mark_command_handled(ctx: &Context, conn: &mut PgConnection, id: i64) -> Result<bool> {
    ctx.run(async {
        let result =
            sqlx::query("UPDATE commands SET handled_at = now() WHERE id = $1 AND handled_at IS NULL")
                .bind(id)
                .execute(&mut *conn)
                .await?;
        Ok::<_, Error>(result.rows_affected() == 1)
    })
    .await
}

fn commands_from(from_id: i64) -> QueryAs<'static, Postgres, CommandRow, PgArguments> {
    sqlx::query_as::<_, CommandRow>(
        "SELECT id, source, type AS command_type, payload, executed_at, handled_at \
         FROM commands WHERE id >= $1 ORDER BY id",
    )
    .bind(from_id)
}

fn unhandled_commands_from(from_id: i64) -> QueryAs<'static, Postgres, CommandRow, PgArguments> {
    sqlx::query_as::<_, CommandRow>(
        "SELECT id, source, type AS command_type, payload, executed_at, handled_at \
         FROM commands WHERE id >= $1 AND handled_at IS NULL ORDER BY id",
    )
    .bind(from_id)
}

/// Feeds every command, handled or not, in id order starting at `from_id`,
/// into `on_command`. Returns `Ok(false)` if `on_command` stopped early.
///
/// # Errors
///
/// Returns database errors, the context's done error, or `on_command`'s
/// error.
pub async fn read_commands<F, Fut>(
    ctx: &Context,
    conn: &mut PgConnection,
    from_id: i64,
    mut on_command: F,
) -> Result<bool>
where
    F: FnMut(Command) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    consume_query(ctx, conn, commands_from(from_id), |row| on_command(row.into())).await
}

/// Feeds unhandled commands, in id order starting at `from_id`, into
/// `on_command`, then keeps waiting for new ones. Returns once `on_command`
/// returns `false`.
///
/// # Errors
///
/// Returns database errors, the context's done error, or `on_command`'s
/// error.
pub async fn read_unhandled_commands_continuously<F, Fut>(
    ctx: &Context,
    pool: &PgPool,
    options: &PollOptions,
    from_id: i64,
    mut on_command: F,
) -> Result<()>
where
    F: FnMut(Command) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    consume_continuously(
        ctx,
        pool,
        options,
        from_id,
        unhandled_commands_from,
        |row: &CommandRow| row.id + 1,
        |row| on_command(row.into()),
    )
    .await
}
