//! Retry backoff and the shared request pacer.
//!
//! # Invariants
//! - `backoff_delay(base, n) == min(base * 2^n, MAX_BACKOFF_SECS)` for every `n`.
//! - Slots handed out by [`RequestPacer`] never move backwards and are at least the
//!   configured spacing apart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// Upper bound of the exponential backoff, in seconds.
pub const MAX_BACKOFF_SECS: u64 = 600;

/// Exponential backoff for retry attempt `attempt` (zero-based), in seconds.
pub fn backoff_delay(base_secs: u64, attempt: u32) -> u64 {
    base_secs
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(MAX_BACKOFF_SECS)
}

/// Delay before retry `attempt`, preferring the provider's hint when it sent one.
pub fn retry_delay(base_secs: u64, attempt: u32, retry_after: Option<Duration>) -> u64 {
    match retry_after {
        Some(hint) => hint.as_secs_f64().ceil() as u64,
        None => backoff_delay(base_secs, attempt),
    }
}

/// Enforces a minimum spacing between requests across every task of an engine.
///
/// Each caller atomically reserves the next free slot and sleeps until it, so concurrent
/// tasks are throttled uniformly without a lock.
#[derive(Debug)]
pub struct RequestPacer {
    spacing: Duration,
    origin: Instant,
    /// Last reserved slot in milliseconds since `origin`, plus one; zero means none yet
    last_slot: AtomicU64,
}

impl RequestPacer {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            origin: Instant::now(),
            last_slot: AtomicU64::new(0),
        }
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    /// Wait for this caller's slot. Returns how long it waited.
    pub async fn wait(&self) -> Duration {
        if self.spacing.is_zero() {
            return Duration::ZERO;
        }

        let spacing_ms = self.spacing.as_millis() as u64;
        let slot = loop {
            let now = self.origin.elapsed().as_millis() as u64;
            let last = self.last_slot.load(Ordering::Acquire);
            let slot = match last {
                0 => now,
                stored => now.max(stored - 1 + spacing_ms),
            };
            if self
                .last_slot
                .compare_exchange(last, slot + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break slot;
            }
        };

        let deadline = self.origin + Duration::from_millis(slot);
        let waited = deadline.saturating_duration_since(Instant::now());
        if !waited.is_zero() {
            tracing::debug!(wait_ms = waited.as_millis() as u64, "Pacing API request");
            tokio::time::sleep_until(deadline).await;
        }
        waited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let delays: Vec<u64> = (0..9).map(|n| backoff_delay(5, n)).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 320, 600, 600]);
        assert_eq!(backoff_delay(5, 200), MAX_BACKOFF_SECS);
        assert_eq!(backoff_delay(0, 3), 0);
    }

    #[test]
    fn test_backoff_matches_formula_for_all_attempts() {
        for base in [1u64, 3, 5, 7] {
            for n in 0..16u32 {
                let expected = (base * 2u64.pow(n)).min(600);
                assert_eq!(backoff_delay(base, n), expected);
            }
        }
    }

    #[test]
    fn test_retry_after_overrides_backoff() {
        assert_eq!(retry_delay(5, 3, Some(Duration::from_millis(2_500))), 3);
        assert_eq!(retry_delay(5, 3, None), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_spaces_concurrent_requests() {
        let pacer = Arc::new(RequestPacer::new(Duration::from_millis(100)));
        let start = Instant::now();

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let pacer = Arc::clone(&pacer);
                tokio::spawn(async move {
                    pacer.wait().await;
                    start.elapsed().as_millis() as u64
                })
            })
            .collect();

        let mut finished = Vec::new();
        for handle in handles {
            finished.push(handle.await.unwrap());
        }
        finished.sort_unstable();
        assert_eq!(finished, vec![0, 100, 200]);
    }

    #[tokio::test]
    async fn test_zero_spacing_never_waits() {
        let pacer = RequestPacer::new(Duration::ZERO);
        assert_eq!(pacer.wait().await, Duration::ZERO);
        assert_eq!(pacer.wait().await, Duration::ZERO);
    }
}
