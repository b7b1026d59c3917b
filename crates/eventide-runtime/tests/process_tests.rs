//! Integration tests for the process runtime.

mod common;

use std::time::Duration;

use common::{Account, Welcome, WelcomeState, deposit, open};
use eventide_core::{Context, Error, Event, JsonSerializer, Serializer};
use eventide_runtime::{
    AggregateRuntime, CommandTarget, ProcessRuntime, WorkerConfig, maintain_process,
};
use eventide_store::{load_process_state, read_commands, read_events};
use eventide_test_support::{checkpoint_next, command_count, wait_until};
use sqlx::PgPool;

async fn seed_account(pool: &PgPool, account: &str) {
    let ctx = Context::background();
    let runtime = AggregateRuntime::new(Account::default());
    let mut conn = pool.acquire().await.unwrap();
    runtime.handle_command(&ctx, &mut conn, &open(account)).await.unwrap();
    runtime.handle_command(&ctx, &mut conn, &deposit(account, 5)).await.unwrap();
}

async fn all_events(pool: &PgPool) -> Vec<Event> {
    let ctx = Context::background();
    let mut conn = pool.acquire().await.unwrap();
    let mut events = Vec::new();
    read_events(&ctx, &mut conn, 0, |event| {
        events.push(event);
        std::future::ready(Ok(true))
    })
    .await
    .unwrap();
    events
}

async fn saved_state(pool: &PgPool, instance: &str) -> Option<WelcomeState> {
    let ctx = Context::background();
    let mut conn = pool.acquire().await.unwrap();
    load_process_state(&ctx, &mut conn, "welcome", instance)
        .await
        .unwrap()
        .map(|bytes| Serializer::<WelcomeState>::deserialize(&JsonSerializer, &bytes).unwrap())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_unrouted_event_executes_nothing_and_saves_nothing(pool: PgPool) {
    // Arrange
    seed_account(&pool, "acc").await;
    let events = all_events(&pool).await;
    let deposited = events.iter().find(|e| e.event_type() == "deposited").unwrap();
    let runtime = ProcessRuntime::new(Welcome::default());
    let ctx = Context::background();
    let mut conn = pool.acquire().await.unwrap();

    // Act
    runtime.handle_event(&ctx, &mut conn, deposited).await.unwrap();

    // Assert
    assert_eq!(command_count(&pool).await, 0);
    assert_eq!(saved_state(&pool, "acc").await, None);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_routed_event_queues_commands_and_accumulates_state(pool: PgPool) {
    // Arrange
    seed_account(&pool, "acc").await;
    let events = all_events(&pool).await;
    let opened = events.iter().find(|e| e.event_type() == "account_opened").unwrap();
    let runtime = ProcessRuntime::new(Welcome::default());
    let ctx = Context::background();
    let mut conn = pool.acquire().await.unwrap();

    // Act
    runtime.handle_event(&ctx, &mut conn, opened).await.unwrap();
    runtime.handle_event(&ctx, &mut conn, opened).await.unwrap();

    // Assert
    assert_eq!(saved_state(&pool, "acc").await, Some(WelcomeState { emails: 2 }));
    let mut commands = Vec::new();
    read_commands(&ctx, &mut conn, 0, |command| {
        commands.push(command);
        std::future::ready(Ok(true))
    })
    .await
    .unwrap();
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[0].source, "process.welcome");
    assert_eq!(commands[0].command_type(), "send_email");
    assert_eq!(
        commands[0].payload().decode::<serde_json::Value>().unwrap()["to"],
        "acc"
    );
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_undeclared_command_fails(pool: PgPool) {
    seed_account(&pool, "acc").await;
    let events = all_events(&pool).await;
    let runtime = ProcessRuntime::new(Welcome { misbehave: true });
    let ctx = Context::background();
    let mut conn = pool.acquire().await.unwrap();

    let result = runtime.handle_event(&ctx, &mut conn, &events[0]).await;

    assert!(matches!(
        result,
        Err(Error::Undeclared { kind: "command", .. })
    ));
    assert_eq!(command_count(&pool).await, 0);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_maintainer_applies_each_event_once_and_checkpoints(pool: PgPool) {
    // Arrange
    seed_account(&pool, "a").await;
    seed_account(&pool, "b").await;
    let ctx = Context::background();
    let config = WorkerConfig {
        idle_timeout: Some(Duration::from_millis(50)),
    };
    let worker = {
        let ctx = ctx.clone();
        let pool = pool.clone();
        tokio::spawn(async move {
            let runtime = ProcessRuntime::new(Welcome::default());
            maintain_process(&ctx, &pool, &config, &runtime).await
        })
    };

    // Act
    let caught_up = wait_until(Duration::from_secs(10), || async {
        checkpoint_next(&pool, "process.welcome").await == Some(4)
    })
    .await;
    ctx.cancel();

    // Assert
    assert!(caught_up);
    assert!(matches!(worker.await.unwrap(), Err(Error::Canceled)));
    assert_eq!(command_count(&pool).await, 2);
    assert_eq!(saved_state(&pool, "a").await, Some(WelcomeState { emails: 1 }));
    assert_eq!(saved_state(&pool, "b").await, Some(WelcomeState { emails: 1 }));
}
