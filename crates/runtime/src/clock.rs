//! Time source abstraction
//!
//! Engine-internal time is milliseconds since epoch. Production uses the
//! system clock; tests drive a tokio-paused clock so scheduled slides
//! fire deterministically.

use async_trait::async_trait;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds-since-epoch clock with an awaitable deadline
#[async_trait]
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;

    /// Complete at or after the given wall-clock deadline
    async fn sleep_until(&self, deadline_ms: i64);
}

/// Real clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    async fn sleep_until(&self, deadline_ms: i64) {
        let now = self.now_ms();
        if deadline_ms > now {
            tokio::time::sleep(Duration::from_millis((deadline_ms - now) as u64)).await;
        }
    }
}

/// Clock pinned to the tokio timer
///
/// Under `#[tokio::test(start_paused = true)]` the timer auto-advances,
/// which makes window and slide arithmetic exact in tests. The epoch is
/// captured at construction and mapped to `base_ms`.
#[derive(Debug, Clone)]
pub struct TokioClock {
    epoch: tokio::time::Instant,
    base_ms: i64,
}

impl TokioClock {
    pub fn starting_at(base_ms: i64) -> Self {
        Self {
            epoch: tokio::time::Instant::now(),
            base_ms,
        }
    }
}

#[async_trait]
impl Clock for TokioClock {
    fn now_ms(&self) -> i64 {
        self.base_ms + self.epoch.elapsed().as_millis() as i64
    }

    async fn sleep_until(&self, deadline_ms: i64) {
        let offset = (deadline_ms - self.base_ms).max(0) as u64;
        let deadline = self.epoch + Duration::from_millis(offset);
        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000); // after 2020
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_tracks_paused_time() {
        let clock = TokioClock::starting_at(1000);
        assert_eq!(clock.now_ms(), 1000);

        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(clock.now_ms(), 1250);

        clock.sleep_until(2000).await;
        assert_eq!(clock.now_ms(), 2000);
    }
}
