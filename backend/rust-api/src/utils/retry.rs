use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Bounded exponential backoff for transient storage errors. Delays double
/// per attempt up to `max_delay`, plus a random jitter of at most `jitter`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(25),
            max_delay: Duration::from_millis(400),
            jitter: Duration::from_millis(40),
        }
    }
}

impl RetryPolicy {
    /// Policy for writes the caller cannot afford to lose (status view).
    pub fn load_bearing() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(1000),
            jitter: Duration::from_millis(100),
        }
    }

    /// Policy that disables retries entirely (best-effort writes are
    /// attempted once and logged on failure).
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    fn delay_for(&self, completed_attempts: u32) -> Duration {
        let exp = completed_attempts.saturating_sub(1).min(16);
        let scaled = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay);

        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            scaled
        } else {
            scaled + Duration::from_millis(rand::random::<u64>() % (jitter_ms + 1))
        }
    }
}

/// Runs `op` until it succeeds or the policy's attempts are spent. Every
/// error is treated as transient and retried; route only transport-level
/// operations through here. A permanent failure (bad payload, serialization)
/// still surfaces, after burning the policy's full attempt budget.
pub async fn with_backoff<F, Fut, T, E>(policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempts = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempts += 1;
                if attempts >= policy.max_attempts {
                    return Err(err);
                }
                let wait = policy.delay_for(attempts);
                tracing::debug!(
                    attempt = attempts,
                    max_attempts = policy.max_attempts,
                    wait_ms = wait.as_millis() as u64,
                    "transient failure, backing off: {}",
                    err
                );
                tokio::time::sleep(wait).await;
            }
        }
    }
}
