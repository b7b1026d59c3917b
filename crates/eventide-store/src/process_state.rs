//! Durable per-instance state of processes.

use eventide_core::{Context, Error, Result};
use sqlx::postgres::PgConnection;

/// Loads the serialized state of one process instance, if any was saved.
///
/// # Errors
///
/// Returns database errors or the context's done error.
pub async fn load_process_state(
    ctx: &Context,
    conn: &mut PgConnection,
    process: &str,
    instance: &str,
) -> Result<Option<Vec<u8>>> {
    ctx.run(async {
        let state: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT state FROM process_states WHERE process = $1 AND instance = $2",
        )
        .bind(process)
        .bind(instance)
        .fetch_optional(&mut *conn)
        .await?;
        Ok::<_, Error>(state)
    })
    .await
}

/// Creates or overwrites the serialized state of one process instance.
///
/// # Errors
///
/// Returns database errors or the context's done error.
pub async fn save_process_state(
    ctx: &Context,
    conn: &mut PgConnection,
    process: &str,
    instance: &str,
    state: &[u8],
) -> Result<()> {
    ctx.run(async {
        sqlx::query(
            "INSERT INTO process_states (process, instance, state) VALUES ($1, $2, $3) \
             ON CONFLICT (process, instance) DO UPDATE SET state = EXCLUDED.state",
        )
        .bind(process)
        .bind(instance)
        .bind(state)
        .execute(&mut *conn)
        .await?;
        Ok::<_, Error>(())
    })
    .await
}
