//! Session-scoped advisory locks on dedicated connections.

use std::future::Future;

use eventide_core::{Context, Error, Result};
use sqlx::postgres::PgConnection;
use sqlx::{Connection, PgPool};
use tracing::{debug, info, warn};

use crate::query::acquire_connection;
use crate::schema::{LOCK_NAMESPACE_CHECKPOINT, LOCK_NAMESPACE_COMMAND_HANDLER};

/// A `(namespace, id)` pair naming a PostgreSQL advisory lock.
///
/// The lock belongs to the session that took it, so it must be held on a
/// connection that does not go back to the pool while the lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdvisoryLock {
    namespace: i32,
    id: i32,
}

impl AdvisoryLock {
    /// Creates a lock key.
    #[must_use]
    pub const fn new(namespace: i32, id: i32) -> Self {
        Self { namespace, id }
    }

    /// The single lock held by the active command handler.
    #[must_use]
    pub const fn command_handler() -> Self {
        Self::new(LOCK_NAMESPACE_COMMAND_HANDLER, 0)
    }

    /// The lock guarding a checkpointed role.
    ///
    /// # Errors
    ///
    /// Returns `Error::Usage` if the checkpoint id does not fit the lock's
    /// 32-bit key.
    pub fn checkpoint(checkpoint_id: i64) -> Result<Self> {
        let id = i32::try_from(checkpoint_id).map_err(|_| {
            Error::Usage(format!("checkpoint id {checkpoint_id} exceeds the advisory lock key range"))
        })?;
        Ok(Self::new(LOCK_NAMESPACE_CHECKPOINT, id))
    }

    /// Lock namespace.
    #[must_use]
    pub const fn namespace(&self) -> i32 {
        self.namespace
    }

    /// Lock id within the namespace.
    #[must_use]
    pub const fn id(&self) -> i32 {
        self.id
    }

    /// Blocks until the lock is granted to `conn`'s session or `ctx` is done.
    ///
    /// If `ctx` finishes first the request is still in flight on `conn`, so
    /// the connection must be discarded rather than reused.
    ///
    /// # Errors
    ///
    /// Returns database errors or the context's done error.
    pub async fn acquire(&self, ctx: &Context, conn: &mut PgConnection) -> Result<()> {
        ctx.run(async {
            sqlx::query("SELECT pg_advisory_lock($1, $2)")
                .bind(self.namespace)
                .bind(self.id)
                .execute(&mut *conn)
                .await?;
            Ok::<_, Error>(())
        })
        .await
    }

    /// Takes the lock if it is free, without waiting.
    ///
    /// # Errors
    ///
    /// Returns database errors or the context's done error.
    pub async fn try_acquire(&self, ctx: &Context, conn: &mut PgConnection) -> Result<bool> {
        ctx.run(async {
            let granted: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1, $2)")
                .bind(self.namespace)
                .bind(self.id)
                .fetch_one(&mut *conn)
                .await?;
            Ok::<_, Error>(granted)
        })
        .await
    }

    /// Releases the lock held by `conn`'s session. Returns `false` if the
    /// session did not hold it.
    ///
    /// Not bound to a context: releasing must still work after the scope that
    /// held the lock is done.
    ///
    /// # Errors
    ///
    /// Returns database errors.
    pub async fn release(&self, conn: &mut PgConnection) -> Result<bool> {
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1, $2)")
            .bind(self.namespace)
            .bind(self.id)
            .fetch_one(conn)
            .await?;
        Ok(released)
    }
}

/// Runs `scope_fn` while holding `lock` on a dedicated connection.
///
/// The connection is detached from the pool for the lock's lifetime. The
/// closure receives a child of `ctx` that is canceled when the closure
/// returns. The lock and the connection are released on every exit path,
/// including when `ctx` is done while still waiting for the lock; dropping
/// the returned future closes the session, which releases the lock
/// server-side.
///
/// # Errors
///
/// Returns database errors, the context's done error, or the closure's
/// error.
pub async fn with_advisory_lock<T, F, Fut>(
    ctx: &Context,
    pool: &PgPool,
    lock: AdvisoryLock,
    scope_fn: F,
) -> Result<T>
where
    F: FnOnce(Context) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut conn = acquire_connection(ctx, pool).await?.detach();
    let scope = ctx.child();
    let (namespace, id) = (lock.namespace, lock.id);
    scope.once_done(move |cause| debug!(namespace, id, ?cause, "advisory lock scope finished"))?;

    debug!(namespace, id, "waiting for advisory lock");
    let mut held = false;
    let result = match lock.acquire(&scope, &mut conn).await {
        Ok(()) => {
            held = true;
            info!(namespace, id, "advisory lock acquired");
            scope.run(scope_fn(scope.clone())).await
        }
        Err(err) => Err(err),
    };
    scope.cancel();

    if held {
        match lock.release(&mut conn).await {
            Ok(true) => info!(namespace, id, "advisory lock released"),
            Ok(false) => warn!(namespace, id, "advisory lock was not held at release"),
            Err(err) => warn!(namespace, id, error = %err, "advisory lock release failed"),
        }
        if let Err(err) = conn.close().await {
            warn!(error = %err, "closing advisory lock connection failed");
        }
    }
    // Otherwise the lock request may still be in flight; dropping the
    // connection ends the session and any lock it was about to be granted.
    result
}
