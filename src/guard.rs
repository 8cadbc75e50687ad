//! Wall-clock deadlines and advisory memory accounting.

use std::future::Future;
use std::time::Duration;

use nix::sys::resource::{getrusage, UsageWho};

use crate::error::Error;

/// Multiplier applied to serialized outcome size when estimating the
/// memory cost of an interpreted run. An approximation, not a measurement.
const MEMORY_COST_FACTOR: u64 = 8;

/// Races an operation against an expiring timer.
///
/// Whichever settles first determines the outcome; on expiry the operation
/// future is dropped and the caller releases whatever it was driving (child
/// process, isolate watchdog). Invoked once per run, never nested.
pub struct ResourceGuard;

impl ResourceGuard {
    pub async fn with_deadline<F, T>(operation: F, timeout: Duration) -> Result<T, Error>
    where
        F: Future<Output = T>,
    {
        match tokio::time::timeout(timeout, operation).await {
            Ok(value) => Ok(value),
            Err(_) => Err(Error::Timeout(timeout.as_millis() as u64)),
        }
    }
}

/// Heuristic memory cost of an interpreted run, derived from the
/// serialized size of what it produced.
pub fn estimate_memory_cost(serialized_bytes: usize) -> u64 {
    serialized_bytes as u64 * MEMORY_COST_FACTOR
}

/// Peak RSS of reaped child processes, in bytes. Cumulative across all
/// children of this process, so this is an upper-bound estimate.
pub fn child_peak_rss_bytes() -> Option<u64> {
    let usage = getrusage(UsageWho::RUSAGE_CHILDREN).ok()?;
    Some(usage.max_rss() as u64 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_fast_operation_completes() {
        let result = ResourceGuard::with_deadline(async { 7 }, Duration::from_secs(1)).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_deadline_fires() {
        let start = Instant::now();
        let result = ResourceGuard::with_deadline(
            tokio::time::sleep(Duration::from_secs(10)),
            Duration::from_millis(100),
        )
        .await;
        assert!(matches!(result, Err(Error::Timeout(100))));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_memory_estimate_scales() {
        assert_eq!(estimate_memory_cost(0), 0);
        assert!(estimate_memory_cost(1_000) > 1_000);
    }
}
