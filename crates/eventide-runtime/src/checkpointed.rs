//! The checkpoint loop shared by processes and projections.
//!
//! One worker per role holds the role's advisory lock and consumes the
//! global event order from the role's checkpoint. Each event is applied in
//! its own transaction together with a compare-and-swap advance of the
//! checkpoint, so an event is never applied twice.

use async_trait::async_trait;
use eventide_core::{Context, Error, Event, Result};
use eventide_store::schema::EVENTS_CHANNEL;
use eventide_store::{
    AdvisoryLock, PollOptions, acquire_connection, advance_checkpoint, begin_transaction,
    ensure_checkpoint, read_checkpoint, read_events_continuously, with_advisory_lock,
};
use sqlx::PgPool;
use sqlx::postgres::PgConnection;
use tracing::{debug, info};

use crate::config::WorkerConfig;
use crate::{Lifecycle, MaintainerState};

#[async_trait]
pub(crate) trait CheckpointHandler: Send + Sync {
    /// Applies one event inside the transaction that advances the
    /// checkpoint past it.
    async fn apply(&self, ctx: &Context, conn: &mut PgConnection, event: &Event) -> Result<()>;
}

pub(crate) async fn maintain_checkpointed<H>(
    ctx: &Context,
    pool: &PgPool,
    config: &WorkerConfig,
    role: &str,
    handler: &H,
) -> Result<()>
where
    H: CheckpointHandler + ?Sized,
{
    let mut lifecycle = Lifecycle::new(role);
    let result = consume(ctx, pool, config, role, handler, &mut lifecycle).await;
    lifecycle.finish(&result);
    result
}

async fn consume<H>(
    ctx: &Context,
    pool: &PgPool,
    config: &WorkerConfig,
    role: &str,
    handler: &H,
    lifecycle: &mut Lifecycle,
) -> Result<()>
where
    H: CheckpointHandler + ?Sized,
{
    lifecycle.enter(MaintainerState::AcquiringConnection);
    let checkpoint_id = {
        let mut conn = acquire_connection(ctx, pool).await?;
        ensure_checkpoint(ctx, &mut conn, role).await?.id
    };

    lifecycle.enter(MaintainerState::AcquiringLock);
    let lock = AdvisoryLock::checkpoint(checkpoint_id)?;
    with_advisory_lock(ctx, pool, lock, |scope| async move {
        // The previous holder may have advanced the checkpoint while we waited.
        let from = {
            let mut conn = acquire_connection(&scope, pool).await?;
            read_checkpoint(&scope, &mut conn, checkpoint_id).await?
        };
        lifecycle.enter(MaintainerState::Streaming);
        info!(role, from, "consuming events");

        let options = PollOptions::new(EVENTS_CHANNEL, config.idle_timeout);
        read_events_continuously(&scope, pool, &options, from, |event| {
            apply_event(&scope, pool, checkpoint_id, handler, event)
        })
        .await
    })
    .await
}

async fn apply_event<H>(
    ctx: &Context,
    pool: &PgPool,
    checkpoint_id: i64,
    handler: &H,
    event: Event,
) -> Result<bool>
where
    H: CheckpointHandler + ?Sized,
{
    let mut tx = begin_transaction(ctx, pool).await?;
    if !advance_checkpoint(ctx, &mut tx, checkpoint_id, event.global_offset).await? {
        debug!(checkpoint_id, global_offset = event.global_offset, "event already applied, skipping");
        return Ok(true);
    }
    handler.apply(ctx, &mut tx, &event).await?;
    ctx.run(async { Ok::<_, Error>(tx.commit().await?) }).await?;

    debug!(
        checkpoint_id,
        global_offset = event.global_offset,
        event_type = event.event_type(),
        "event applied"
    );
    Ok(true)
}
