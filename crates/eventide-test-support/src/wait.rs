//! Polling helper for conditions reached asynchronously by background workers.

use std::future::Future;
use std::time::Duration;

/// Polls `check` every 10ms until it returns `true` or `timeout` elapses.
/// Returns whether the condition was met.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
