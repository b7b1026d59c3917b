//! Projections: checkpointed appliers of arbitrary effects.

use async_trait::async_trait;
use eventide_core::{Context, Event, Result};
use eventide_store::schema::projection_checkpoint_type;
use sqlx::PgPool;
use sqlx::postgres::PgConnection;

use crate::checkpointed::{CheckpointHandler, maintain_checkpointed};
use crate::config::WorkerConfig;

/// Applies every event, in global order, exactly once.
#[async_trait]
pub trait Projection: Send + Sync {
    /// Unique projection name; its checkpoint is `projection.<name>`.
    fn name(&self) -> &str;

    /// Applies one event. `conn` is inside the transaction that advances
    /// the checkpoint, so writes made through it commit atomically with it.
    ///
    /// # Errors
    ///
    /// Any error rolls the event back and stops the maintainer.
    async fn apply_event(&self, ctx: &Context, conn: &mut PgConnection, event: &Event)
    -> Result<()>;
}

struct ProjectionRole<'a, P: ?Sized>(&'a P);

#[async_trait]
impl<'a, P> CheckpointHandler for ProjectionRole<'a, P>
where
    P: Projection + ?Sized,
{
    async fn apply(&self, ctx: &Context, conn: &mut PgConnection, event: &Event) -> Result<()> {
        self.0.apply_event(ctx, conn, event).await
    }
}

/// Runs `projection` until `ctx` is done or applying an event fails.
///
/// Blocks while another worker maintains the same projection.
///
/// # Errors
///
/// Returns the context's done error on shutdown, or the first failure.
pub async fn maintain_projection<P>(
    ctx: &Context,
    pool: &PgPool,
    config: &WorkerConfig,
    projection: &P,
) -> Result<()>
where
    P: Projection + ?Sized,
{
    let role = projection_checkpoint_type(projection.name());
    maintain_checkpointed(ctx, pool, config, &role, &ProjectionRole(projection)).await
}
