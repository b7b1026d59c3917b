//! Integration tests for advisory locks.

use std::time::Duration;

use eventide_core::{Context, Error};
use eventide_store::lock::AdvisoryLock;
use eventide_store::with_advisory_lock;
use eventide_test_support::wait_until;
use sqlx::PgPool;

const LOCK: AdvisoryLock = AdvisoryLock::new(7, 1);

async fn is_free(pool: &PgPool) -> bool {
    let ctx = Context::background();
    let mut conn = pool.acquire().await.unwrap();
    let granted = LOCK.try_acquire(&ctx, &mut conn).await.unwrap();
    if granted {
        LOCK.release(&mut conn).await.unwrap();
    }
    granted
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_lock_is_held_for_scope_and_released_after(pool: PgPool) {
    // Arrange
    let ctx = Context::background();
    let probe_pool = pool.clone();

    // Act
    let (free_inside, scope) = with_advisory_lock(&ctx, &pool, LOCK, |scope| async move {
        Ok((is_free(&probe_pool).await, scope))
    })
    .await
    .unwrap();

    // Assert
    assert!(!free_inside);
    assert!(scope.is_done(), "scope is canceled once the closure returns");
    assert!(!ctx.is_done());
    assert!(is_free(&pool).await);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_closure_error_still_releases_lock(pool: PgPool) {
    let ctx = Context::background();

    let result: Result<(), Error> = with_advisory_lock(&ctx, &pool, LOCK, |_| async {
        Err(Error::handler("boom"))
    })
    .await;

    assert!(matches!(result, Err(Error::Handler(_))));
    assert!(is_free(&pool).await);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_cancel_while_waiting_for_lock_never_runs_closure(pool: PgPool) {
    // Arrange
    let holder_ctx = Context::background();
    let mut holder = pool.acquire().await.unwrap();
    LOCK.acquire(&holder_ctx, &mut holder).await.unwrap();

    let ctx = Context::background();
    let waiter = {
        let ctx = ctx.clone();
        let pool = pool.clone();
        tokio::spawn(async move {
            with_advisory_lock(&ctx, &pool, LOCK, |_| async { Ok(true) }).await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Act
    ctx.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), waiter).await;
    LOCK.release(&mut holder).await.unwrap();

    // Assert
    assert!(matches!(result.unwrap().unwrap(), Err(Error::Canceled)));
    assert!(wait_until(Duration::from_secs(5), || is_free(&pool)).await);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_second_holder_waits_for_first(pool: PgPool) {
    let ctx = Context::background();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let (held_tx, held_rx) = tokio::sync::oneshot::channel::<()>();
    let first = {
        let ctx = ctx.clone();
        let pool = pool.clone();
        tokio::spawn(async move {
            with_advisory_lock(&ctx, &pool, LOCK, |_| async move {
                let _ = held_tx.send(());
                let _ = release_rx.await;
                Ok(())
            })
            .await
        })
    };
    held_rx.await.unwrap();

    let second_ctx = ctx.with_timeout(Duration::from_millis(100));
    let blocked = with_advisory_lock(&second_ctx, &pool, LOCK, |_| async { Ok(()) }).await;
    let _ = release_tx.send(());
    first.await.unwrap().unwrap();
    let acquired = with_advisory_lock(&ctx, &pool, LOCK, |_| async { Ok(()) }).await;

    assert!(matches!(blocked, Err(Error::TimedOut)));
    assert!(acquired.is_ok());
}

#[test]
fn test_checkpoint_lock_rejects_ids_outside_key_range() {
    assert!(AdvisoryLock::checkpoint(42).is_ok());
    assert!(matches!(
        AdvisoryLock::checkpoint(i64::from(i32::MAX) + 1),
        Err(Error::Usage(_))
    ));
}
