//! Durable "next offset to consume" markers for checkpointed roles.

use eventide_core::{Context, Error, Result};
use sqlx::postgres::PgConnection;

/// A role's position in the global event order.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Checkpoint {
    /// Row id; also keys the role's advisory lock.
    pub id: i64,
    /// Role name, e.g. `projection.ledger`.
    #[sqlx(rename = "type")]
    pub checkpoint_type: String,
    /// Next global offset to consume.
    pub next: i64,
}

/// Returns the checkpoint for `checkpoint_type`, creating it at offset 0 on
/// first use.
///
/// # Errors
///
/// Returns `Error::Usage` for an empty type, database errors, or the
/// context's done error.
pub async fn ensure_checkpoint(
    ctx: &Context,
    conn: &mut PgConnection,
    checkpoint_type: &str,
) -> Result<Checkpoint> {
    if checkpoint_type.is_empty() {
        return Err(Error::Usage("checkpoint type must not be empty".into()));
    }
    ctx.run(async {
        let checkpoint = sqlx::query_as::<_, Checkpoint>(
            "INSERT INTO checkpoints (type) VALUES ($1) \
             ON CONFLICT (type) DO UPDATE SET type = EXCLUDED.type \
             RETURNING id, type, next",
        )
        .bind(checkpoint_type)
        .fetch_one(&mut *conn)
        .await?;
        Ok::<_, Error>(checkpoint)
    })
    .await
}

/// Reads the current next offset of checkpoint `id`.
///
/// # Errors
///
/// Returns `Error::Usage` if no such checkpoint exists, database errors, or
/// the context's done error.
pub async fn read_checkpoint(ctx: &Context, conn: &mut PgConnection, id: i64) -> Result<i64> {
    ctx.run(async {
        let next: Option<i64> = sqlx::query_scalar("SELECT next FROM checkpoints WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        next.ok_or_else(|| Error::Usage(format!("checkpoint {id} does not exist")))
    })
    .await
}

/// Moves checkpoint `id` from `expected_next` to `expected_next + 1`.
/// Returns `false` if it was not at `expected_next`.
///
/// Run it in the same transaction as the effect it accounts for.
///
/// # Errors
///
/// Returns database errors or the context's done error.
pub async fn advance_checkpoint(
    ctx: &Context,
    conn: &mut PgConnection,
    id: i64,
    expected_next: i64,
) -> Result<bool> {
    ctx.run(async {
        let result = sqlx::query("UPDATE checkpoints SET next = next + 1 WHERE id = $1 AND next = $2")
            .bind(id)
            .bind(expected_next)
            .execute(&mut *conn)
            .await?;
        Ok::<_, Error>(result.rows_affected() == 1)
    })
    .await
}
