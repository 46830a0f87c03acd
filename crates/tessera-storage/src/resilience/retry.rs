//! Bounded retry with exponential backoff

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use tessera_core::StorageError;

use super::error::ResilienceError;

/// Retry policy for a single write
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total calls, including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Scale each delay by a random factor in `[0.5, 1.0)`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Result of [`RetryPolicy::execute`] with bookkeeping
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, ResilienceError>,
    /// Calls made to the operation
    pub attempts: u32,
    /// Time spent sleeping between attempts
    pub total_backoff: Duration,
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after failed attempt `attempt` (0-indexed), before jitter
    ///
    /// `min(base_delay * backoff_multiplier^attempt, max_delay)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        // NaN and infinity collapse onto the cap
        let secs = secs.min(self.max_delay.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(secs)
    }

    /// Upper bound on the total sleep of one exhausted sequence
    pub fn max_total_backoff(&self) -> Duration {
        (0..self.max_attempts.max(1)).map(|i| self.delay_for(i)).sum()
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter {
            delay.mul_f64(rand::rng().random_range(0.5..1.0))
        } else {
            delay
        }
    }

    /// Run `op` until it succeeds, fails non-retryably, or attempts run out
    ///
    /// Sleeps with `tokio::time::sleep` between attempts, so this must run on
    /// the task that owns the write path.
    pub async fn execute<T, F>(&self, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Result<T, StorageError>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut total_backoff = Duration::ZERO;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match op() {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                        total_backoff,
                    };
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                return RetryOutcome {
                    result: Err(ResilienceError::Rejected(err)),
                    attempts: attempt,
                    total_backoff,
                };
            }
            if attempt >= max_attempts {
                return RetryOutcome {
                    result: Err(ResilienceError::RetryExhausted {
                        attempts: attempt,
                        last_error: err,
                    }),
                    attempts: attempt,
                    total_backoff,
                };
            }

            let delay = self.jittered(self.delay_for(attempt - 1));
            debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying write");
            tokio::time::sleep(delay).await;
            total_backoff += delay;
        }
    }

    /// Like [`execute`](Self::execute) without the bookkeeping
    pub async fn run<T, F>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Result<T, StorageError>,
    {
        self.execute(op).await.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(3)
            .with_delays(Duration::from_millis(100), Duration::from_millis(150))
            .with_multiplier(2.0)
            .with_jitter(false)
    }

    #[test]
    fn test_delay_schedule() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(150));
        assert_eq!(p.delay_for(30), Duration::from_millis(150));
        assert_eq!(p.max_total_backoff(), Duration::from_millis(400));
    }

    #[test]
    fn test_degenerate_multiplier() {
        let p = policy().with_multiplier(f64::NAN);
        assert_eq!(p.delay_for(2), Duration::from_millis(150));
        let p = policy().with_multiplier(-3.0);
        assert_eq!(p.delay_for(1), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_exhausts() {
        let mut calls = 0;
        let outcome = policy()
            .execute(|| -> Result<(), _> {
                calls += 1;
                Err(StorageError::transient("locked"))
            })
            .await;

        assert_eq!(calls, 3);
        assert_eq!(outcome.attempts, 3);
        assert!(matches!(
            outcome.result,
            Err(ResilienceError::RetryExhausted { attempts: 3, .. })
        ));
        // Two sleeps: 100ms then 150ms
        assert_eq!(outcome.total_backoff, Duration::from_millis(250));
        assert!(outcome.total_backoff <= policy().max_total_backoff());
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_stays_within_bounds() {
        let p = policy().with_jitter(true);
        let outcome = p
            .execute(|| -> Result<(), _> { Err(StorageError::transient("x")) })
            .await;
        assert!(outcome.total_backoff >= Duration::from_millis(125));
        assert!(outcome.total_backoff < Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_failures() {
        let mut calls = 0;
        let value = policy()
            .run(|| {
                calls += 1;
                if calls < 3 {
                    Err(StorageError::unavailable("down"))
                } else {
                    Ok(calls)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let mut calls = 0;
        let outcome = policy()
            .execute(|| -> Result<(), _> {
                calls += 1;
                Err(StorageError::serialization("bad field"))
            })
            .await;
        assert_eq!(calls, 1);
        assert_eq!(outcome.total_backoff, Duration::ZERO);
        assert!(matches!(outcome.result, Err(ResilienceError::Rejected(_))));
    }
}
