//! Orchestrator configuration.
//!
//! Loaded from a TOML file; every section and field has a default so an
//! empty (or missing) file yields a working configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::recovery::RecoverySettings;
use crate::retry::RetryPolicy;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;
const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
const DEFAULT_DISPATCH_PRIORITY: u8 = 100;

// ─── [retry] ──────────────────────────────────────────────────────────────────

/// Retry policy applied to orchestration calls and task invocations
/// (`[retry]` in restack.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub exponential_backoff: bool,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            exponential_backoff: true,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            exponential_backoff: self.exponential_backoff,
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
        }
    }
}

// ─── [worker] ─────────────────────────────────────────────────────────────────

/// Worker loop tuning (`[worker]`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Ceiling for a single task executor invocation.
    pub task_timeout_secs: u64,
    /// Idle sleep between queue polls.
    pub poll_interval_ms: u64,
    /// Priority for dispatched work items (higher = sooner).
    pub dispatch_priority: u8,
    /// Cap on chunk splitting after context-length failures.
    pub max_chunk_divisor: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            task_timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            dispatch_priority: DEFAULT_DISPATCH_PRIORITY,
            max_chunk_divisor: 8,
        }
    }
}

impl WorkerConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ─── [recovery] ───────────────────────────────────────────────────────────────

/// Recovery strategy tuning (`[recovery]`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub rate_limit_max_wait_secs: u64,
    pub rate_limit_default_wait_secs: u64,
    pub db_reconnect_attempts: u32,
    pub db_reconnect_delay_ms: u64,
    pub breaker_threshold: u32,
    pub breaker_window_secs: u64,
    pub breaker_cool_off_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        let defaults = RecoverySettings::default();
        Self {
            rate_limit_max_wait_secs: defaults.rate_limit_max_wait.as_secs(),
            rate_limit_default_wait_secs: defaults.rate_limit_default_wait.as_secs(),
            db_reconnect_attempts: defaults.db_reconnect_attempts,
            db_reconnect_delay_ms: defaults.db_reconnect_delay.as_millis() as u64,
            breaker_threshold: defaults.breaker_threshold,
            breaker_window_secs: defaults.breaker_window.as_secs(),
            breaker_cool_off_secs: defaults.breaker_cool_off.as_secs(),
        }
    }
}

impl RecoveryConfig {
    pub fn settings(&self) -> RecoverySettings {
        RecoverySettings {
            rate_limit_max_wait: Duration::from_secs(self.rate_limit_max_wait_secs),
            rate_limit_default_wait: Duration::from_secs(self.rate_limit_default_wait_secs),
            db_reconnect_attempts: self.db_reconnect_attempts,
            db_reconnect_delay: Duration::from_millis(self.db_reconnect_delay_ms),
            breaker_threshold: self.breaker_threshold,
            breaker_window: Duration::from_secs(self.breaker_window_secs),
            breaker_cool_off: Duration::from_secs(self.breaker_cool_off_secs),
        }
    }
}

// ─── Top level ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub retry: RetryConfig,
    pub worker: WorkerConfig,
    pub recovery: RecoveryConfig,
}

impl OrchestratorConfig {
    /// Parse a TOML document. Unknown keys are ignored; missing sections
    /// fall back to defaults.
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load from a file, falling back to defaults when it does not exist.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => {
                let config = Self::from_toml(&text)?;
                info!(path = %path.display(), "configuration loaded");
                Ok(config)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no config file — using defaults");
                Ok(Self::default())
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = OrchestratorConfig::from_toml("").unwrap();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.worker.task_timeout_secs, 300);
        assert_eq!(config.recovery.breaker_threshold, 10);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config = OrchestratorConfig::from_toml(
            r#"
            [retry]
            max_retries = 7
            jitter = false
            "#,
        )
        .unwrap();
        assert_eq!(config.retry.max_retries, 7);
        assert!(!config.retry.jitter);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.worker.poll_interval_ms, 250);
    }

    #[test]
    fn policy_conversion_round_trips() {
        let config = RetryConfig::default();
        let policy = config.policy();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(1_000));
        assert_eq!(policy.max_delay, Duration::from_millis(30_000));
    }
}
