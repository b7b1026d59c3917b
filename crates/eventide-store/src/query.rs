//! Context-bound connections and lazy row streaming.

use std::future::Future;

use eventide_core::{Context, Error, Result};
use futures::TryStreamExt;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgConnection, PgRow};
use sqlx::query::QueryAs;
use sqlx::{FromRow, PgPool, Postgres, Transaction};

/// Borrows a pooled connection, giving up when `ctx` is done. The connection
/// returns to the pool when dropped.
///
/// # Errors
///
/// Returns `Error::Database` if the pool fails, or the context's done error.
pub async fn acquire_connection(ctx: &Context, pool: &PgPool) -> Result<PoolConnection<Postgres>> {
    ctx.run(async { Ok::<_, Error>(pool.acquire().await?) })
        .await
}

/// Begins a transaction on a pooled connection, giving up when `ctx` is
/// done. Dropping the transaction without committing rolls it back.
///
/// # Errors
///
/// Returns `Error::Database` if the pool fails, or the context's done error.
pub async fn begin_transaction(
    ctx: &Context,
    pool: &PgPool,
) -> Result<Transaction<'static, Postgres>> {
    ctx.run(async { Ok::<_, Error>(pool.begin().await?) })
        .await
}

/// Runs `query` on `conn` and feeds its rows one at a time into `on_row`
/// without buffering the result set.
///
/// Each row fetch and each `on_row` call is raced against `ctx`. Returns
/// `Ok(true)` when the rows are exhausted and `Ok(false)` when `on_row`
/// asked to stop by returning `false`. The row stream is dropped on every
/// exit path, leaving `conn` usable by the caller.
///
/// # Errors
///
/// Returns database errors, the context's done error, or whatever `on_row`
/// fails with.
pub async fn consume_query<'q, O, F, Fut>(
    ctx: &Context,
    conn: &mut PgConnection,
    query: QueryAs<'q, Postgres, O, PgArguments>,
    mut on_row: F,
) -> Result<bool>
where
    O: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    F: FnMut(O) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut rows = query.fetch(conn);
    while let Some(row) = ctx
        .run(async { Ok::<_, Error>(rows.try_next().await?) })
        .await?
    {
        if !ctx.run(on_row(row)).await? {
            return Ok(false);
        }
    }
    Ok(true)
}
