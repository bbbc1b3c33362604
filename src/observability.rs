//! Tracing setup and small observability helpers.

use std::time::Instant;

use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Install a compact stdout subscriber. `RUST_LOG` overrides the default
/// filter. A second call is a no-op rather than a panic — embedders and
/// tests may already have a subscriber installed.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("restack=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .try_init();
}

/// Track latency of an operation and emit a structured event on finish.
pub struct LatencyTracker {
    operation: String,
    start: Instant,
}

impl LatencyTracker {
    pub fn start(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            start: Instant::now(),
        }
    }

    /// Slow operations (>1s) log at info, the rest at debug.
    pub fn finish(self) {
        let elapsed_ms = self.start.elapsed().as_millis();
        if elapsed_ms > 1000 {
            info!(operation = %self.operation, elapsed_ms, "slow operation");
        } else {
            debug!(operation = %self.operation, elapsed_ms, "operation complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_finishes_without_panicking() {
        let tracker = LatencyTracker::start("job.start");
        tracker.finish();
    }

    #[test]
    fn init_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
