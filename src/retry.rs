use std::future::Future;
use std::time::Duration;

use anyhow::{Result, anyhow};
use rand::Rng as _;
use tokio::time::{sleep, timeout};

/// Bounded exponential backoff for idempotent chain and wallet reads.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub attempt_timeout: Duration,
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(10),
            max_retries: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            jitter_ms: 250,
        }
    }
}

impl BackoffConfig {
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exp = u32::try_from(attempt).unwrap_or(u32::MAX);
        let backoff = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp));
        let capped = backoff.min(self.max_delay);
        let jitter = if self.jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=self.jitter_ms))
        };
        capped + jitter
    }
}

/// Runs `action` until it succeeds, giving up after `max_retries` retries.
/// Each attempt is bounded by `attempt_timeout`; the last error is returned.
pub async fn retry_with_backoff<T, F, Fut>(
    label: &str,
    config: &BackoffConfig,
    mut action: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.max_retries.saturating_add(1);
    for attempt in 0..attempts {
        let last = attempt + 1 >= attempts;
        match timeout(config.attempt_timeout, action()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => {
                if last {
                    return Err(err.context(format!("{label}: gave up after {attempts} attempts")));
                }
                tracing::warn!(attempt = attempt + 1, error = %format!("{err:#}"), "{label} failed; retrying");
            }
            Err(_) => {
                if last {
                    return Err(anyhow!("{label}: timed out after {attempts} attempts"));
                }
                tracing::warn!(attempt = attempt + 1, "{label} timed out; retrying");
            }
        }

        sleep(config.delay_for(attempt)).await;
    }

    Err(anyhow!("{label}: retries exhausted"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn fast() -> BackoffConfig {
        BackoffConfig {
            attempt_timeout: Duration::from_millis(50),
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter_ms: 0,
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result = retry_with_backoff("read timeouts", &fast(), || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(anyhow!("node unavailable"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_last_error_when_exhausted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result: Result<()> = retry_with_backoff("read timeouts", &fast(), || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("node unavailable"))
            }
        })
        .await;
        let err = result.unwrap_err();
        assert!(format!("{err:#}").contains("node unavailable"));
        assert!(err.to_string().contains("gave up after 3 attempts"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn times_out_slow_attempts() {
        let config = BackoffConfig {
            attempt_timeout: Duration::from_millis(5),
            max_retries: 1,
            ..fast()
        };
        let result = retry_with_backoff("slow read", &config, || async {
            sleep(Duration::from_millis(50)).await;
            Ok(())
        })
        .await;
        assert!(result.unwrap_err().to_string().contains("timed out"));
    }

    #[test]
    fn delay_is_capped() {
        let config = BackoffConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            jitter_ms: 0,
            ..BackoffConfig::default()
        };
        assert_eq!(config.delay_for(0), Duration::from_millis(100));
        assert_eq!(config.delay_for(1), Duration::from_millis(200));
        assert_eq!(config.delay_for(5), Duration::from_millis(300));
    }
}
