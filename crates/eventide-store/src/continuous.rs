//! Hybrid notification / idle-timer consumption of monotonic queries.
//!
//! A continuous query is re-run forever from the key after the last row it
//! delivered. When a run comes back exhausted, the consumer waits for
//! whichever comes first: a notification on the channel, the idle timer, or
//! the context becoming done. Notifications only cut latency. The idle timer
//! is what guarantees progress when a notification is missed, for example
//! one sent between `LISTEN` and the first poll.

use std::future::Future;
use std::time::Duration;

use eventide_core::{Context, Error, Result};
use sqlx::postgres::{PgArguments, PgListener, PgRow};
use sqlx::query::QueryAs;
use sqlx::{FromRow, PgPool, Postgres};
use tracing::{debug, trace};

use crate::query::{acquire_connection, consume_query};

/// How a continuous query decides to re-poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOptions {
    /// Notification channel to `LISTEN` on.
    pub channel: String,
    /// Re-poll after this much idle time. `None` relies solely on
    /// notifications.
    pub idle_timeout: Option<Duration>,
}

impl PollOptions {
    /// Creates poll options for `channel`.
    #[must_use]
    pub fn new(channel: impl Into<String>, idle_timeout: Option<Duration>) -> Self {
        Self {
            channel: channel.into(),
            idle_timeout,
        }
    }
}

/// Consumes `make_query(key)` continuously, starting at `from_key`.
///
/// `next_key` maps each delivered row to the key the next poll starts from.
/// Returns `Ok(())` once `on_row` returns `false`; otherwise runs until the
/// context is done or an error occurs. The listener connection is released on
/// every exit path.
///
/// # Errors
///
/// Returns database errors, the context's done error, or whatever `on_row`
/// fails with.
pub async fn consume_continuously<O, Q, K, F, Fut>(
    ctx: &Context,
    pool: &PgPool,
    options: &PollOptions,
    from_key: i64,
    mut make_query: Q,
    next_key: K,
    mut on_row: F,
) -> Result<()>
where
    O: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    Q: FnMut(i64) -> QueryAs<'static, Postgres, O, PgArguments>,
    K: Fn(&O) -> i64,
    F: FnMut(O) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    // Listen before the first poll so nothing committed afterwards is missed.
    let mut listener = ctx
        .run(async { Ok::<_, Error>(PgListener::connect_with(pool).await?) })
        .await?;
    ctx.run(async { Ok::<_, Error>(listener.listen(&options.channel).await?) })
        .await?;
    debug!(channel = %options.channel, from_key, "continuous query listening");

    let mut key = from_key;
    loop {
        let query = make_query(key);
        let mut conn = acquire_connection(ctx, pool).await?;
        let exhausted = consume_query(ctx, &mut conn, query, |row| {
            key = next_key(&row);
            on_row(row)
        })
        .await?;
        drop(conn);

        if !exhausted {
            debug!(channel = %options.channel, key, "continuous query stopped by consumer");
            return Ok(());
        }
        wait_for_wakeup(ctx, &mut listener, options).await?;
    }
}

async fn wait_for_wakeup(
    ctx: &Context,
    listener: &mut PgListener,
    options: &PollOptions,
) -> Result<()> {
    let idle = async {
        match options.idle_timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        cause = ctx.done() => Err(cause.into()),
        notification = listener.recv() => {
            let notification = notification?;
            trace!(
                channel = notification.channel(),
                payload = notification.payload(),
                "woken by notification"
            );
            Ok(())
        }
        () = idle => {
            trace!(channel = %options.channel, "woken by idle timer");
            Ok(())
        }
    }
}
