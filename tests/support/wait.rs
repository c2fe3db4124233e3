use std::future::Future;
use std::time::Duration;

use anyhow::{Context as _, Result};
use eth_xmr_swap::swap::{SwapSession, SwapStatus, wait_for_terminal};
use tokio::time::Instant;

/// Waits until `session` leaves the ongoing statuses.
pub async fn wait_settled(session: &dyn SwapSession, timeout: Duration) -> Result<SwapStatus> {
    tokio::time::timeout(timeout, wait_for_terminal(session.subscribe_status()))
        .await
        .with_context(|| {
            format!(
                "timeout waiting for {} swap {} to settle (status {})",
                session.role().as_str(),
                session.id(),
                session.status()
            )
        })
}

pub async fn wait_for<T, F, Fut>(description: &str, timeout: Duration, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    let mut sleep_for = Duration::from_millis(50);

    loop {
        if let Some(value) = f().await.with_context(|| format!("poll {description}"))? {
            return Ok(value);
        }
        if Instant::now() >= deadline {
            anyhow::bail!("timeout waiting for {description}");
        }
        tokio::time::sleep(sleep_for).await;
        sleep_for = (sleep_for * 2).min(Duration::from_millis(500));
    }
}
