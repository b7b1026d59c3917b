//! Integration tests for checkpoints and process state.

use eventide_core::{Context, Error};
use eventide_store::{
    advance_checkpoint, ensure_checkpoint, load_process_state, read_checkpoint,
    save_process_state,
};
use sqlx::PgPool;

#[sqlx::test(migrations = "../../migrations")]
async fn test_ensure_checkpoint_is_idempotent(pool: PgPool) {
    let ctx = Context::background();
    let mut conn = pool.acquire().await.unwrap();

    let first = ensure_checkpoint(&ctx, &mut conn, "projection.ledger")
        .await
        .unwrap();
    let second = ensure_checkpoint(&ctx, &mut conn, "projection.ledger")
        .await
        .unwrap();
    let other = ensure_checkpoint(&ctx, &mut conn, "projection.audit")
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(first.next, 0);
    assert_eq!(first.checkpoint_type, "projection.ledger");
    assert_ne!(first.id, other.id);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_advance_checkpoint_is_compare_and_swap(pool: PgPool) {
    // Arrange
    let ctx = Context::background();
    let mut conn = pool.acquire().await.unwrap();
    let checkpoint = ensure_checkpoint(&ctx, &mut conn, "process.transfer")
        .await
        .unwrap();

    // Act
    let advanced = advance_checkpoint(&ctx, &mut conn, checkpoint.id, 0)
        .await
        .unwrap();
    let stale = advance_checkpoint(&ctx, &mut conn, checkpoint.id, 0)
        .await
        .unwrap();

    // Assert
    assert!(advanced);
    assert!(!stale);
    assert_eq!(read_checkpoint(&ctx, &mut conn, checkpoint.id).await.unwrap(), 1);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_read_unknown_checkpoint_is_usage_error(pool: PgPool) {
    let ctx = Context::background();
    let mut conn = pool.acquire().await.unwrap();

    let result = read_checkpoint(&ctx, &mut conn, 4242).await;

    assert!(matches!(result, Err(Error::Usage(_))));
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_process_state_round_trips_and_overwrites(pool: PgPool) {
    let ctx = Context::background();
    let mut conn = pool.acquire().await.unwrap();

    let missing = load_process_state(&ctx, &mut conn, "transfer", "t-1")
        .await
        .unwrap();
    save_process_state(&ctx, &mut conn, "transfer", "t-1", b"{\"step\":1}")
        .await
        .unwrap();
    save_process_state(&ctx, &mut conn, "transfer", "t-1", b"{\"step\":2}")
        .await
        .unwrap();
    let saved = load_process_state(&ctx, &mut conn, "transfer", "t-1")
        .await
        .unwrap();

    assert_eq!(missing, None);
    assert_eq!(saved.as_deref(), Some(&b"{\"step\":2}"[..]));
}
