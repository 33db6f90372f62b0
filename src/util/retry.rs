use std::future::Future;
use std::time::Duration;

use tinyrand::{Rand, RandRange, Seeded, StdRand};
use tinyrand_std::ClockSeed;

use crate::constants::{RETRY_BASE_DELAY_MS, RETRY_MAX_DELAY_MS};
use crate::db::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; never less than one
    pub attempts: u32,
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base: Duration::from_millis(RETRY_BASE_DELAY_MS),
            factor: 2,
            cap: Duration::from_millis(RETRY_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            ..Default::default()
        }
    }

    /// Backoff before retry number `attempt` (1-based), without jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .factor
            .saturating_pow(attempt.saturating_sub(1))
            .max(1);

        self.base.saturating_mul(exp).min(self.cap)
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        let half = (delay.as_millis() as u64 / 2).max(1);

        let seed = ClockSeed::default().next_u64();
        let mut rng = StdRand::seed(seed);

        delay + Duration::from_millis(rng.next_range(0..half))
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the attempt budget is
/// spent. `op` receives the 1-based attempt number.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, name: &str, mut op: F) -> StoreResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                let wait = policy.jittered(attempt);
                tracing::warn!(
                    operation = name,
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    error = %err,
                    "transient storage failure, retrying"
                );

                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_transient() {
                    tracing::error!(operation = name, attempt, error = %err, "retry budget exhausted");
                }

                return Err(err);
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn transient() -> StoreError {
    StoreError::SqlxError(sqlx::Error::PoolTimedOut)
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay(1), Duration::from_millis(25));
        assert_eq!(policy.delay(2), Duration::from_millis(50));
        assert_eq!(policy.delay(3), Duration::from_millis(100));
        assert_eq!(policy.delay(10), Duration::from_millis(1000));
        assert_eq!(policy.delay(40), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::with_attempts(3);

        let res = with_backoff(&policy, "flaky", |attempt| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 { Err(transient()) } else { Ok(attempt) }
            }
        })
        .await;

        assert_eq!(res.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::with_attempts(2);

        let res: StoreResult<()> = with_backoff(&policy, "down", |_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            }
        })
        .await;

        assert!(res.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));

        let res: StoreResult<()> = with_backoff(&RetryPolicy::default(), "broken", |_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::SqlxError(sqlx::Error::RowNotFound))
            }
        })
        .await;

        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
