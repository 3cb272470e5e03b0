//! Test doubles for the limiter's time seams.
//!
//! Available in test builds and with the `test-helpers` feature.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::clock::{Clock, Waiter};
use crate::error::{RateLimitError, Result};

/// Mock clock for testing.
///
/// All clones share the same time value, so advancing time in one clone
/// affects all of them.
#[derive(Debug, Clone)]
pub struct MockClock {
    now: Arc<AtomicU64>,
}

impl MockClock {
    /// Create a mock clock starting at `start` epoch millis.
    pub fn new(start: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.now
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Waiter that returns immediately and records every requested wait.
///
/// When built with [`RecordingWaiter::advancing`], each wait also moves the
/// given clock forward by the waited duration, as a real sleep would.
#[derive(Debug, Clone, Default)]
pub struct RecordingWaiter {
    waits: Arc<Mutex<Vec<Duration>>>,
    clock: Option<MockClock>,
    interrupted: Arc<AtomicBool>,
}

impl RecordingWaiter {
    /// A waiter that advances `clock` by each waited duration.
    pub fn advancing(clock: &MockClock) -> Self {
        Self {
            clock: Some(clock.clone()),
            ..Self::default()
        }
    }

    /// Make every subsequent wait fail as interrupted.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    /// All waits requested so far, in order.
    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().clone()
    }

    /// Sum of all waits requested so far.
    pub fn total(&self) -> Duration {
        self.waits.lock().iter().sum()
    }
}

#[async_trait]
impl Waiter for RecordingWaiter {
    async fn wait(&self, duration: Duration) -> Result<()> {
        if self.interrupted.load(Ordering::SeqCst) {
            return Err(RateLimitError::Interrupted);
        }
        self.waits.lock().push(duration);
        if let Some(clock) = &self.clock {
            clock.advance(duration);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_clock() {
        let clock = MockClock::new(1_000);
        assert_eq!(clock.now_millis(), 1_000);

        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now_millis(), 1_250);

        clock.set(5_000);
        assert_eq!(clock.clone().now_millis(), 5_000);
    }

    #[tokio::test]
    async fn test_recording_waiter_advances_clock() {
        let clock = MockClock::new(1_000);
        let waiter = RecordingWaiter::advancing(&clock);

        waiter.wait(Duration::from_millis(100)).await.unwrap();
        waiter.wait(Duration::from_millis(50)).await.unwrap();

        assert_eq!(waiter.waits(), vec![Duration::from_millis(100), Duration::from_millis(50)]);
        assert_eq!(waiter.total(), Duration::from_millis(150));
        assert_eq!(clock.now_millis(), 1_150);

        waiter.interrupt();
        assert!(waiter.wait(Duration::from_millis(10)).await.is_err());
        assert_eq!(waiter.waits().len(), 2);
    }
}
