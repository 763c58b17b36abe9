//! Retry with exponential backoff and a per-attempt deadline.
//!
//! Attempt `n` (1-based) that fails is followed by a delay of
//! `base_delay * 2^(n-1)`; no delay follows the last attempt. Each attempt
//! races the provider call against `call_timeout` on the injected clock.

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::metrics;
use crate::provider::ProviderFailure;

/// Why a single attempt failed.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptError {
    /// The provider reported a failure.
    Provider(ProviderFailure),
    /// The attempt outlived its deadline.
    Timeout(Duration),
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Provider(e) => write!(f, "{e}"),
            AttemptError::Timeout(d) => write!(f, "timed out after {}ms", d.as_millis()),
        }
    }
}

/// All attempts failed.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryExhausted {
    /// Attempts made.
    pub attempts: u32,
    /// Failure of the final attempt.
    pub last: AttemptError,
}

/// Retry policy shared by direct and queued dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Values below 1 behave as 1.
    pub max_retries: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Deadline of each individual attempt.
    pub call_timeout: Duration,
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based).
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Run `op` until it succeeds or the attempts are exhausted.
    ///
    /// `op` is invoked once per attempt. Backoff and deadlines go through
    /// `clock`; a deadline that fires leaves the attempt's future dropped.
    pub async fn run<T, F, Fut>(
        &self,
        clock: &dyn Clock,
        provider: &str,
        mut op: F,
    ) -> Result<T, RetryExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderFailure>>,
    {
        let max = self.max_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            metrics::inc_attempt(provider);
            debug!(provider, attempt, max, "dispatch: attempt");

            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                result = op() => result.map_err(AttemptError::Provider),
                _ = clock.sleep(self.call_timeout) => Err(AttemptError::Timeout(self.call_timeout)),
            };
            metrics::record_call_latency(provider, started.elapsed());

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(provider, attempt, "dispatch: succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    warn!(provider, attempt, max, error = %error, "dispatch: attempt failed");
                    if attempt >= max {
                        return Err(RetryExhausted {
                            attempts: attempt,
                            last: error,
                        });
                    }
                    let delay = self.delay_for(attempt);
                    debug!(provider, delay_ms = delay.as_millis() as u64, "dispatch: backing off");
                    clock.sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(100),
            call_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_delay_doubles_each_attempt() {
        let p = policy(5);
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_always_failing_stops_at_max_retries() {
        let clock = ManualClock::default();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(3)
            .run(&clock, "p", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderFailure::Network("down".into())) }
            })
            .await;

        let err = result.expect_err("test: must exhaust");
        assert_eq!(err.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test]
    async fn test_success_after_one_failure() {
        let clock = ManualClock::default();
        let calls = AtomicU32::new(0);
        let result = policy(3)
            .run(&clock, "p", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(ProviderFailure::RateLimited("slow down".into()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result, Ok("done"));
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(100)]);
    }

    #[tokio::test]
    async fn test_pending_call_times_out() {
        let clock = ManualClock::default();
        let result: Result<(), _> = policy(1)
            .run(&clock, "p", || std::future::pending::<Result<(), ProviderFailure>>())
            .await;
        let err = result.expect_err("test: must time out");
        assert_eq!(err.last, AttemptError::Timeout(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_zero_max_retries_still_attempts_once() {
        let clock = ManualClock::default();
        let calls = AtomicU32::new(0);
        let _ = policy(0)
            .run(&clock, "p", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ProviderFailure::Network("x".into())) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
