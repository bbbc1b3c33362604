// SPDX-License-Identifier: MIT
//! Bounded retry with exponential backoff and jitter.
//!
//! [`RetryExecutor::execute`] runs a fallible async operation, classifies
//! each failure, and retries while the failure is retryable and the attempt
//! bound has not been reached. With jitter disabled the schedule is fully
//! deterministic: delays of `base, 2·base, 4·base, …` capped at `max_delay`.
//!
//! The sleep between attempts is scoped to the one operation being retried —
//! no lock is held, other jobs keep making progress.

use std::time::Duration;

use tracing::{debug, warn};

use crate::classify::IntoAppError;
use crate::error::{AppError, ErrorContext};

// ── Policy ───────────────────────────────────────────────────────────────────

/// Retry policy for one operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt. Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Double the delay after each retry. When `false`, every delay is
    /// `base_delay`.
    pub exponential_backoff: bool,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Perturb each delay by up to ±50% to avoid synchronized retry storms
    /// across concurrent jobs.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            exponential_backoff: true,
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy suitable for unit tests — no real waiting, no jitter.
    pub fn instant() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            exponential_backoff: true,
            max_delay: Duration::from_millis(10),
            jitter: false,
        }
    }

    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            exponential_backoff: false,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }
}

// ── Executor ─────────────────────────────────────────────────────────────────

/// Successful result plus observability counters.
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    /// Attempts actually made (1 = succeeded first try).
    pub attempts: u32,
    /// Wall-clock time spent, sleeps included.
    pub elapsed: Duration,
}

/// Runs operations under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    /// Per-executor jitter seed so concurrent jobs don't share a schedule.
    seed: u64,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        // Derive the seed from a fresh UUID rather than pulling in `rand`.
        let seed = uuid::Uuid::new_v4().as_u128() as u64;
        Self { policy, seed }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delay before retry number `attempt` (0-indexed), jitter included.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.policy.base_delay.as_millis() as f64;
        let raw = if self.policy.exponential_backoff {
            base * 2f64.powi(attempt.min(62) as i32)
        } else {
            base
        };
        let capped = raw.min(self.policy.max_delay.as_millis() as f64);
        let with_jitter = if self.policy.jitter {
            // ±50% uniform.
            (capped + capped * pseudo_rand(self.seed.wrapping_add(attempt as u64))).max(0.0)
        } else {
            capped
        };
        Duration::from_millis(with_jitter as u64)
    }

    /// Run `op`, retrying retryable failures with backoff.
    ///
    /// Returns the classified error of the last attempt when the operation is
    /// not retryable or the bound is exhausted.
    pub async fn execute<T, E, F, Fut>(
        &self,
        context: &ErrorContext,
        mut op: F,
    ) -> Result<Retried<T>, AppError>
    where
        E: IntoAppError,
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let started = std::time::Instant::now();
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(
                            operation = %context.operation,
                            attempts = attempt + 1,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "retry succeeded"
                        );
                    }
                    return Ok(Retried {
                        value,
                        attempts: attempt + 1,
                        elapsed: started.elapsed(),
                    });
                }
                Err(raw) => {
                    let err = raw.into_app_error(context);
                    if !err.retryable || attempt >= self.policy.max_retries {
                        warn!(
                            operation = %context.operation,
                            code = err.code,
                            attempts = attempt + 1,
                            retryable = err.retryable,
                            "giving up: {}",
                            err.message
                        );
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = %context.operation,
                        code = err.code,
                        attempt = attempt + 1,
                        max = self.policy.max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        "attempt failed — retrying: {}",
                        err.message
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

/// Float in [-0.5, 0.5) from a simple LCG step — avoids a `rand` dependency
/// for a jitter spread that only needs to be uneven, not unpredictable.
fn pseudo_rand(seed: u64) -> f64 {
    const A: u64 = 1_664_525;
    const C: u64 = 1_013_904_223;
    const M: u64 = 1u64 << 32;
    let state = A.wrapping_mul(seed).wrapping_add(C) % M;
    (state as f64 / M as f64) - 0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Failure;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn ctx() -> ErrorContext {
        ErrorContext::new("test_op")
    }

    #[test]
    fn deterministic_delays_without_jitter() {
        let exec = RetryExecutor::new(RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            exponential_backoff: true,
            max_delay: Duration::from_secs(30),
            jitter: false,
        });
        assert_eq!(exec.delay_for(0), Duration::from_millis(1000));
        assert_eq!(exec.delay_for(1), Duration::from_millis(2000));
        assert_eq!(exec.delay_for(2), Duration::from_millis(4000));
    }

    #[test]
    fn delay_capped_at_max() {
        let exec = RetryExecutor::new(RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(1000),
            exponential_backoff: true,
            max_delay: Duration::from_millis(5000),
            jitter: false,
        });
        assert_eq!(exec.delay_for(10), Duration::from_millis(5000));
    }

    #[test]
    fn linear_delays_when_backoff_disabled() {
        let exec = RetryExecutor::new(RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(700),
            exponential_backoff: false,
            max_delay: Duration::from_secs(30),
            jitter: false,
        });
        assert_eq!(exec.delay_for(0), Duration::from_millis(700));
        assert_eq!(exec.delay_for(5), Duration::from_millis(700));
    }

    #[test]
    fn jitter_stays_within_half_of_delay() {
        let exec = RetryExecutor::new(RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            exponential_backoff: false,
            max_delay: Duration::from_secs(30),
            jitter: true,
        });
        for attempt in 0..50 {
            let d = exec.delay_for(attempt).as_millis() as i64;
            assert!((500..=1500).contains(&d), "jittered delay {d}ms out of range");
        }
    }

    #[tokio::test]
    async fn retryable_failure_makes_exactly_max_plus_one_attempts() {
        let exec = RetryExecutor::new(RetryPolicy {
            max_retries: 3,
            ..RetryPolicy::instant()
        });
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<Retried<()>, _> = exec
            .execute(&ctx(), || {
                let c = calls2.clone();
                async move {
                    c.fetch_add(1, Ordering::Relaxed);
                    Err::<(), _>(Failure::msg("connect ECONNREFUSED"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 4); // 1 initial + 3 retries
    }

    #[tokio::test]
    async fn non_retryable_failure_is_not_retried() {
        let exec = RetryExecutor::new(RetryPolicy::instant());
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<Retried<()>, _> = exec
            .execute(&ctx(), || {
                let c = calls2.clone();
                async move {
                    c.fetch_add(1, Ordering::Relaxed);
                    Err::<(), _>(Failure::msg("SyntaxError: unexpected token"))
                }
            })
            .await;

        let err = result.unwrap_err();
        assert!(!err.retryable);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn succeeds_mid_schedule_and_reports_attempts() {
        let exec = RetryExecutor::new(RetryPolicy::instant());
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let retried = exec
            .execute(&ctx(), || {
                let c = calls2.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::Relaxed) + 1;
                    if n < 3 {
                        Err(Failure::msg("network unreachable"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(retried.value, 3);
        assert_eq!(retried.attempts, 3);
    }

    #[tokio::test]
    async fn already_classified_errors_pass_through() {
        let exec = RetryExecutor::new(RetryPolicy::instant());
        let result: Result<Retried<()>, _> = exec
            .execute(&ctx(), || async {
                Err::<(), _>(AppError::not_found("job-9", ctx()))
            })
            .await;
        assert_eq!(result.unwrap_err().code, "NOT_FOUND");
    }
}
