// ABOUTME: Instrumentation hook invoked after each per-key slice fetch
// ABOUTME: Observers see timings and query shapes but cannot alter the run

use std::time::Duration;

use super::types::ChangeKey;

/// Details of one slice fetch.
#[derive(Debug)]
pub struct SliceFetched<'a> {
    pub key: &'a ChangeKey,
    pub query: &'a str,
    pub elapsed: Duration,
    pub rows: usize,
}

/// Side-effect-only extension point for observability.
pub trait SliceObserver: Send + Sync {
    fn on_slice_fetched(&self, event: &SliceFetched<'_>);
}

/// Logs every fetch at debug level and slow ones at warn level.
#[derive(Debug, Clone)]
pub struct TracingObserver {
    slow_threshold: Duration,
}

impl TracingObserver {
    pub fn new(slow_threshold: Duration) -> Self {
        Self { slow_threshold }
    }
}

impl Default for TracingObserver {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl SliceObserver for TracingObserver {
    fn on_slice_fetched(&self, event: &SliceFetched<'_>) {
        if event.elapsed >= self.slow_threshold {
            tracing::warn!(
                "Slow slice fetch for {} took {:?}: {}",
                event.key,
                event.elapsed,
                event.query
            );
        } else {
            tracing::debug!(
                "Fetched {} row(s) for {} in {:?}",
                event.rows,
                event.key,
                event.elapsed
            );
        }
    }
}
