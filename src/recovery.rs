// SPDX-License-Identifier: MIT
//! Category-specific failure remediation.
//!
//! Before the generic retry path runs, the [`RecoveryRegistry`] gives the
//! failed category a chance at a smarter response: wait out a rate limit,
//! shrink an oversized input, reconnect the database, or switch the task
//! executor into a stricter mode. Strategies report one of three outcomes;
//! unrecognized categories conservatively give up.
//!
//! A per-category failure breaker guards against retry storms: when one
//! category fails repeatedly across jobs within a short window, its strategy
//! is short-circuited to give-up until a cool-off elapses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{AppError, ErrorCategory};
use crate::store::JobStore;

// ── Outcomes & context ───────────────────────────────────────────────────────

/// What a strategy decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The underlying condition was remedied; re-run the operation once
    /// before falling back to the retry schedule.
    Recovered,
    /// Nothing more to do here; hand the failure to the plain retry path.
    Retry,
    /// Not recoverable; escalate.
    GiveUp,
}

/// Hook for the context-length strategy: halve the scope of the next
/// attempt. Returns `false` when the input cannot be split further.
pub trait ShrinkableScope: Send + Sync {
    fn shrink(&self) -> bool;
}

/// Chunk-divisor scope: each shrink doubles the divisor up to a cap.
pub struct ChunkScope {
    divisor: std::sync::atomic::AtomicU32,
    max_divisor: u32,
}

impl ChunkScope {
    pub fn new(max_divisor: u32) -> Self {
        Self {
            divisor: std::sync::atomic::AtomicU32::new(1),
            max_divisor,
        }
    }

    /// Current divisor — an executor divides its input into this many chunks.
    pub fn divisor(&self) -> u32 {
        self.divisor.load(Ordering::Relaxed)
    }
}

impl ShrinkableScope for ChunkScope {
    fn shrink(&self) -> bool {
        let current = self.divisor.load(Ordering::Relaxed);
        if current >= self.max_divisor {
            return false;
        }
        self.divisor
            .compare_exchange(current, current * 2, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

/// What the registry may touch while attempting recovery.
#[derive(Clone)]
pub struct RecoveryContext {
    /// Record store, for the database reconnect probe.
    pub store: Arc<dyn JobStore>,
    /// Input-splitting hook, when the operation supports reduced scope.
    pub scope: Option<Arc<dyn ShrinkableScope>>,
    /// Stricter-mode flag observed by the task executor on the next attempt.
    pub strict_mode: Option<Arc<AtomicBool>>,
}

impl RecoveryContext {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            scope: None,
            strict_mode: None,
        }
    }

    pub fn with_scope(mut self, scope: Arc<dyn ShrinkableScope>) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_strict_mode(mut self, flag: Arc<AtomicBool>) -> Self {
        self.strict_mode = Some(flag);
        self
    }
}

/// A category-specific remediation.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    async fn attempt(&self, error: &AppError, ctx: &RecoveryContext) -> RecoveryOutcome;
}

// ── Settings ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RecoverySettings {
    /// Cap on how long the rate-limit strategy will wait for a reset.
    pub rate_limit_max_wait: Duration,
    /// Fallback wait when the provider gave no reset signal.
    pub rate_limit_default_wait: Duration,
    /// Reconnect probes before the database strategy gives up.
    pub db_reconnect_attempts: u32,
    pub db_reconnect_delay: Duration,
    /// Failure breaker: failures of one category within `breaker_window`
    /// before recovery short-circuits to give-up.
    pub breaker_threshold: u32,
    pub breaker_window: Duration,
    pub breaker_cool_off: Duration,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            rate_limit_max_wait: Duration::from_secs(60),
            rate_limit_default_wait: Duration::from_secs(5),
            db_reconnect_attempts: 3,
            db_reconnect_delay: Duration::from_millis(500),
            breaker_threshold: 10,
            breaker_window: Duration::from_secs(60),
            breaker_cool_off: Duration::from_secs(120),
        }
    }
}

impl RecoverySettings {
    /// No real waiting — for unit tests.
    pub fn instant() -> Self {
        Self {
            rate_limit_max_wait: Duration::from_millis(10),
            rate_limit_default_wait: Duration::from_millis(1),
            db_reconnect_attempts: 2,
            db_reconnect_delay: Duration::from_millis(1),
            breaker_threshold: 10,
            breaker_window: Duration::from_secs(60),
            breaker_cool_off: Duration::from_millis(50),
        }
    }
}

// ── Failure breaker ──────────────────────────────────────────────────────────

/// Sliding-window failure counter per category.
///
/// Tripped → all recovery for the category short-circuits to give-up until
/// the cool-off elapses. Protects upstream services from synchronized
/// retry storms across many jobs.
struct FailureBreaker {
    threshold: u32,
    window: Duration,
    cool_off: Duration,
    state: Mutex<HashMap<ErrorCategory, BreakerEntry>>,
}

#[derive(Default)]
struct BreakerEntry {
    failures: Vec<Instant>,
    tripped_at: Option<Instant>,
}

impl FailureBreaker {
    fn new(threshold: u32, window: Duration, cool_off: Duration) -> Self {
        Self {
            threshold,
            window,
            cool_off,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure; returns `true` if the category is (now) tripped.
    async fn record_and_check(&self, category: ErrorCategory) -> bool {
        let mut state = self.state.lock().await;
        let entry = state.entry(category).or_default();
        let now = Instant::now();

        if let Some(tripped_at) = entry.tripped_at {
            if now.duration_since(tripped_at) < self.cool_off {
                return true;
            }
            // Cool-off over — close and start counting fresh.
            info!(category = %category, "failure breaker closed after cool-off");
            entry.tripped_at = None;
            entry.failures.clear();
        }

        entry.failures.push(now);
        let window = self.window;
        entry.failures.retain(|at| now.duration_since(*at) < window);
        if entry.failures.len() as u32 >= self.threshold {
            warn!(
                category = %category,
                failures = entry.failures.len(),
                "failure breaker tripped — giving up without retry"
            );
            entry.tripped_at = Some(now);
            return true;
        }
        false
    }
}

// ── Built-in strategies ──────────────────────────────────────────────────────

/// Rate limit: honor the provider's reset signal, then fall back to retry.
struct RateLimitWait {
    max_wait: Duration,
    default_wait: Duration,
}

#[async_trait]
impl RecoveryStrategy for RateLimitWait {
    async fn attempt(&self, error: &AppError, _ctx: &RecoveryContext) -> RecoveryOutcome {
        let meta = &error.context.metadata;
        let wait = meta
            .get("retry_after_ms")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .or_else(|| {
                // Unix-epoch reset, as GitHub's x-ratelimit-reset reports it.
                meta.get("rate_limit_reset")
                    .and_then(|v| v.parse::<i64>().ok())
                    .and_then(|epoch| {
                        let delta = epoch - chrono::Utc::now().timestamp();
                        (delta > 0).then(|| Duration::from_secs(delta as u64))
                    })
            })
            .unwrap_or(self.default_wait)
            .min(self.max_wait);
        debug!(
            code = error.code,
            wait_ms = wait.as_millis() as u64,
            "waiting out rate limit"
        );
        tokio::time::sleep(wait).await;
        RecoveryOutcome::Retry
    }
}

/// Context length: shrink the input scope, or give up if indivisible.
struct SplitInput;

#[async_trait]
impl RecoveryStrategy for SplitInput {
    async fn attempt(&self, error: &AppError, ctx: &RecoveryContext) -> RecoveryOutcome {
        match &ctx.scope {
            Some(scope) if scope.shrink() => {
                info!(code = error.code, "input split for reduced-scope retry");
                RecoveryOutcome::Retry
            }
            _ => {
                warn!(code = error.code, "input cannot be split further");
                RecoveryOutcome::GiveUp
            }
        }
    }
}

/// Database: probe reconnection with bounded backoff, then retry the
/// original operation.
struct DatabaseReconnect {
    attempts: u32,
    delay: Duration,
}

#[async_trait]
impl RecoveryStrategy for DatabaseReconnect {
    async fn attempt(&self, _error: &AppError, ctx: &RecoveryContext) -> RecoveryOutcome {
        for attempt in 0..self.attempts {
            if attempt > 0 {
                tokio::time::sleep(self.delay * 2u32.saturating_pow(attempt - 1)).await;
            }
            if ctx.store.ping().await.is_ok() {
                info!(attempt = attempt + 1, "database reachable again");
                return RecoveryOutcome::Retry;
            }
        }
        warn!(attempts = self.attempts, "database still unreachable");
        RecoveryOutcome::GiveUp
    }
}

/// Transient network failures need no special action — backoff handles them.
struct NetworkTransient;

#[async_trait]
impl RecoveryStrategy for NetworkTransient {
    async fn attempt(&self, _error: &AppError, _ctx: &RecoveryContext) -> RecoveryOutcome {
        RecoveryOutcome::Retry
    }
}

/// Syntax failure: flip the executor into strict mode for the next attempt;
/// if it already was strict, give up.
struct NarrowSyntax;

#[async_trait]
impl RecoveryStrategy for NarrowSyntax {
    async fn attempt(&self, error: &AppError, ctx: &RecoveryContext) -> RecoveryOutcome {
        match &ctx.strict_mode {
            Some(flag) if !flag.swap(true, Ordering::Relaxed) => {
                info!(code = error.code, "re-running task in strict mode");
                RecoveryOutcome::Retry
            }
            _ => RecoveryOutcome::GiveUp,
        }
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Maps error categories to recovery strategies.
pub struct RecoveryRegistry {
    strategies: HashMap<ErrorCategory, Box<dyn RecoveryStrategy>>,
    breaker: FailureBreaker,
}

impl RecoveryRegistry {
    /// Registry with the built-in strategies.
    pub fn with_defaults(settings: &RecoverySettings) -> Self {
        let mut strategies: HashMap<ErrorCategory, Box<dyn RecoveryStrategy>> = HashMap::new();
        let rate_limit = || RateLimitWait {
            max_wait: settings.rate_limit_max_wait,
            default_wait: settings.rate_limit_default_wait,
        };
        strategies.insert(ErrorCategory::GithubRateLimit, Box::new(rate_limit()));
        strategies.insert(ErrorCategory::AiRateLimit, Box::new(rate_limit()));
        strategies.insert(ErrorCategory::AiContextLength, Box::new(SplitInput));
        strategies.insert(
            ErrorCategory::DatabaseConnection,
            Box::new(DatabaseReconnect {
                attempts: settings.db_reconnect_attempts,
                delay: settings.db_reconnect_delay,
            }),
        );
        strategies.insert(ErrorCategory::Network, Box::new(NetworkTransient));
        strategies.insert(ErrorCategory::AiModelFailure, Box::new(NetworkTransient));
        strategies.insert(ErrorCategory::PreviewStartup, Box::new(NetworkTransient));
        strategies.insert(ErrorCategory::ConversionSyntax, Box::new(NarrowSyntax));

        Self {
            strategies,
            breaker: FailureBreaker::new(
                settings.breaker_threshold,
                settings.breaker_window,
                settings.breaker_cool_off,
            ),
        }
    }

    /// Register or replace the strategy for a category.
    pub fn register(&mut self, category: ErrorCategory, strategy: Box<dyn RecoveryStrategy>) {
        self.strategies.insert(category, strategy);
    }

    /// Attempt remediation for a classified error.
    ///
    /// The failure is first recorded against the category's breaker; a
    /// tripped breaker short-circuits to [`RecoveryOutcome::GiveUp`].
    /// Categories without a registered strategy give up.
    pub async fn attempt(&self, error: &AppError, ctx: &RecoveryContext) -> RecoveryOutcome {
        if self.breaker.record_and_check(error.category).await {
            return RecoveryOutcome::GiveUp;
        }
        match self.strategies.get(&error.category) {
            Some(strategy) => strategy.attempt(error, ctx).await,
            None => {
                debug!(category = %error.category, "no recovery strategy — giving up");
                RecoveryOutcome::GiveUp
            }
        }
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

/// Rounds of recovery consultation before an operation is declared lost.
/// Strategies self-terminate (scope caps out, strict mode flips once, the
/// breaker trips) — this bound is a backstop, not the main limiter.
const MAX_RECOVERY_ROUNDS: u32 = 3;

/// The full failure pipeline: attempt → classify → recovery strategy →
/// bounded retry → escalate.
///
/// Recovery is consulted before the plain retry path each round, so a
/// strategy that adjusts the next attempt (splitting input, strict mode)
/// takes effect even for categories that are not plainly retryable.
pub async fn run_recoverable<T, E, F, Fut>(
    registry: &RecoveryRegistry,
    retry: &crate::retry::RetryExecutor,
    ctx: &crate::error::ErrorContext,
    rctx: &RecoveryContext,
    mut op: F,
) -> Result<T, AppError>
where
    E: crate::classify::IntoAppError,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    for round in 1..=MAX_RECOVERY_ROUNDS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(raw) => {
                let err = raw.into_app_error(ctx);
                if round == MAX_RECOVERY_ROUNDS {
                    return Err(err);
                }
                match registry.attempt(&err, rctx).await {
                    RecoveryOutcome::GiveUp => return Err(err),
                    // Condition remedied — re-run on the next round.
                    RecoveryOutcome::Recovered => continue,
                    RecoveryOutcome::Retry => match retry.execute(ctx, &mut op).await {
                        Ok(retried) => return Ok(retried.value),
                        // Exhausted this round's schedule; let recovery look
                        // at the fresh classification once more.
                        Err(_) => continue,
                    },
                }
            }
        }
    }
    // The loop always returns from its final round.
    unreachable!("recovery pipeline exited without a result")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Failure;
    use crate::error::{AppError, ErrorContext};
    use crate::retry::{RetryExecutor, RetryPolicy};
    use crate::store::MemoryJobStore;

    fn registry() -> RecoveryRegistry {
        RecoveryRegistry::with_defaults(&RecoverySettings::instant())
    }

    fn ctx() -> RecoveryContext {
        RecoveryContext::new(Arc::new(MemoryJobStore::new()))
    }

    fn err(category: ErrorCategory) -> AppError {
        AppError::new(category, "boom", ErrorContext::new("test_op"))
    }

    #[tokio::test]
    async fn network_falls_back_to_retry() {
        let outcome = registry().attempt(&err(ErrorCategory::Network), &ctx()).await;
        assert_eq!(outcome, RecoveryOutcome::Retry);
    }

    #[tokio::test]
    async fn unknown_category_gives_up() {
        let outcome = registry().attempt(&err(ErrorCategory::Unknown), &ctx()).await;
        assert_eq!(outcome, RecoveryOutcome::GiveUp);
    }

    #[tokio::test]
    async fn validation_gives_up() {
        let outcome = registry()
            .attempt(&err(ErrorCategory::Validation), &ctx())
            .await;
        assert_eq!(outcome, RecoveryOutcome::GiveUp);
    }

    #[tokio::test]
    async fn rate_limit_waits_for_reset_signal_then_retries() {
        let error = AppError::new(
            ErrorCategory::AiRateLimit,
            "429 too many requests",
            ErrorContext::new("test_op").with_meta("retry_after_ms", "5"),
        );
        let started = Instant::now();
        let outcome = registry().attempt(&error, &ctx()).await;
        assert_eq!(outcome, RecoveryOutcome::Retry);
        assert!(started.elapsed() >= Duration::from_millis(5));
    }

    #[tokio::test]
    async fn rate_limit_wait_is_capped() {
        let error = AppError::new(
            ErrorCategory::GithubRateLimit,
            "rate limited",
            // Reset an hour away — must be capped to the configured max.
            ErrorContext::new("test_op").with_meta(
                "rate_limit_reset",
                (chrono::Utc::now().timestamp() + 3600).to_string(),
            ),
        );
        let started = Instant::now();
        registry().attempt(&error, &ctx()).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn context_length_shrinks_until_indivisible() {
        let scope = Arc::new(ChunkScope::new(4));
        let ctx = ctx().with_scope(scope.clone());
        let registry = registry();
        let error = err(ErrorCategory::AiContextLength);

        assert_eq!(registry.attempt(&error, &ctx).await, RecoveryOutcome::Retry);
        assert_eq!(scope.divisor(), 2);
        assert_eq!(registry.attempt(&error, &ctx).await, RecoveryOutcome::Retry);
        assert_eq!(scope.divisor(), 4);
        // At the cap: indivisible.
        assert_eq!(registry.attempt(&error, &ctx).await, RecoveryOutcome::GiveUp);
    }

    #[tokio::test]
    async fn context_length_without_scope_gives_up() {
        let outcome = registry()
            .attempt(&err(ErrorCategory::AiContextLength), &ctx())
            .await;
        assert_eq!(outcome, RecoveryOutcome::GiveUp);
    }

    #[tokio::test]
    async fn database_reconnect_probes_and_retries() {
        // MemoryJobStore always pings OK — reconnect succeeds immediately.
        let outcome = registry()
            .attempt(&err(ErrorCategory::DatabaseConnection), &ctx())
            .await;
        assert_eq!(outcome, RecoveryOutcome::Retry);
    }

    #[tokio::test]
    async fn syntax_strategy_flips_strict_mode_once() {
        let strict = Arc::new(AtomicBool::new(false));
        let ctx = ctx().with_strict_mode(strict.clone());
        let registry = registry();
        let error = err(ErrorCategory::ConversionSyntax);

        assert_eq!(registry.attempt(&error, &ctx).await, RecoveryOutcome::Retry);
        assert!(strict.load(Ordering::Relaxed));
        // Already strict — repeated syntax failure gives up.
        assert_eq!(registry.attempt(&error, &ctx).await, RecoveryOutcome::GiveUp);
    }

    #[tokio::test]
    async fn breaker_short_circuits_after_repeated_category_failures() {
        let settings = RecoverySettings {
            breaker_threshold: 3,
            breaker_cool_off: Duration::from_secs(60),
            ..RecoverySettings::instant()
        };
        let registry = RecoveryRegistry::with_defaults(&settings);
        let error = err(ErrorCategory::Network);
        let ctx = ctx();

        assert_eq!(registry.attempt(&error, &ctx).await, RecoveryOutcome::Retry);
        assert_eq!(registry.attempt(&error, &ctx).await, RecoveryOutcome::Retry);
        // Third failure within the window trips the breaker.
        assert_eq!(registry.attempt(&error, &ctx).await, RecoveryOutcome::GiveUp);
        assert_eq!(registry.attempt(&error, &ctx).await, RecoveryOutcome::GiveUp);

        // Other categories are unaffected.
        assert_eq!(
            registry.attempt(&err(ErrorCategory::AiModelFailure), &ctx).await,
            RecoveryOutcome::Retry
        );
    }

    #[tokio::test]
    async fn breaker_closes_after_cool_off() {
        let settings = RecoverySettings {
            breaker_threshold: 2,
            breaker_cool_off: Duration::from_millis(20),
            ..RecoverySettings::instant()
        };
        let registry = RecoveryRegistry::with_defaults(&settings);
        let error = err(ErrorCategory::Network);
        let ctx = ctx();

        registry.attempt(&error, &ctx).await;
        assert_eq!(registry.attempt(&error, &ctx).await, RecoveryOutcome::GiveUp);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.attempt(&error, &ctx).await, RecoveryOutcome::Retry);
    }

    #[tokio::test]
    async fn pipeline_recovers_after_input_split() {
        let scope = Arc::new(ChunkScope::new(4));
        let rctx = ctx().with_scope(scope.clone());
        let registry = registry();
        let retry = RetryExecutor::new(RetryPolicy::instant());
        let ectx = ErrorContext::new("generate_code");

        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let calls2 = calls.clone();
        let scope2 = scope.clone();
        let result = run_recoverable(&registry, &retry, &ectx, &rctx, move || {
            let calls = calls2.clone();
            let scope = scope2.clone();
            async move {
                calls.fetch_add(1, Ordering::Relaxed);
                if scope.divisor() >= 2 {
                    Ok("fits")
                } else {
                    Err(Failure::msg("maximum context length exceeded"))
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "fits");
        // First attempt overflows, the split strategy shrinks the scope, and
        // the retry pass succeeds.
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert_eq!(scope.divisor(), 2);
    }

    #[tokio::test]
    async fn pipeline_escalates_when_no_strategy_applies() {
        let registry = registry();
        let retry = RetryExecutor::new(RetryPolicy::instant());
        let ectx = ErrorContext::new("analyze");

        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let calls2 = calls.clone();
        let err = run_recoverable::<(), _, _, _>(&registry, &retry, &ectx, &ctx(), move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::Relaxed);
                Err(Failure::msg("something inexplicable"))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(err.category, ErrorCategory::Unknown);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
