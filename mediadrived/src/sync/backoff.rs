use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::provider::ProviderError;

/// Longest wait honoured from a throttling response.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Delay before retry `n`: `initial * 2^n`, capped. With jitter the delay is
/// drawn from the upper half of that value.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial: Duration,
    cap: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration, jitter: bool) -> Self {
        Self {
            initial,
            cap: cap.max(initial),
            jitter,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay, false)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let grown = self
            .initial
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.cap);
        if !self.jitter || grown.is_zero() {
            return grown;
        }
        let half = grown / 2;
        half + rng.gen_range(Duration::ZERO..=half)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Backoff) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, file_id: &str, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < self.attempts => {
                    let delay = err
                        .retry_after()
                        .map(|wait| wait.min(MAX_RETRY_AFTER))
                        .unwrap_or_else(|| self.backoff.delay(attempt));
                    attempt += 1;
                    warn!(file_id, attempt, ?delay, error = %err, "retrying remote fetch");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Backoff::fixed(Duration::from_secs(1)))
    }
}
