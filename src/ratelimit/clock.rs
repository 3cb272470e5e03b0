//! Time sources and wait strategies used by the limiter.
//!
//! Both are injectable so tests can drive throttling deterministically. See
//! `MockClock` and `RecordingWaiter` in `ratelimit::mocks`.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::{RateLimitError, Result};

/// Source of wall-clock time in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// System clock implementation using the current UTC time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

/// How the limiter waits out the remainder of a minimum interval.
#[async_trait]
pub trait Waiter: Send + Sync {
    /// Wait for `duration`, or fail with [`RateLimitError::Interrupted`].
    async fn wait(&self, duration: Duration) -> Result<()>;
}

/// Handle that interrupts every current and future wait of the
/// [`SleepWaiter`]s created from it.
#[derive(Debug, Clone)]
pub struct Interrupt {
    tx: Arc<watch::Sender<bool>>,
}

impl Interrupt {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
        }
    }

    /// Abort all pending and future waits.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits by sleeping on the tokio timer.
#[derive(Debug, Clone, Default)]
pub struct SleepWaiter {
    interrupt: Option<watch::Receiver<bool>>,
}

impl SleepWaiter {
    /// A waiter that can only be cancelled by dropping the wait.
    pub fn new() -> Self {
        Self::default()
    }

    /// A waiter whose waits end early with an error once `interrupt` fires.
    pub fn with_interrupt(interrupt: &Interrupt) -> Self {
        Self {
            interrupt: Some(interrupt.subscribe()),
        }
    }
}

#[async_trait]
impl Waiter for SleepWaiter {
    async fn wait(&self, duration: Duration) -> Result<()> {
        let Some(interrupt) = &self.interrupt else {
            tokio::time::sleep(duration).await;
            return Ok(());
        };

        let mut rx = interrupt.clone();
        let interrupted = async move {
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Every Interrupt handle is gone, so nothing can fire.
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            biased;
            _ = interrupted => Err(RateLimitError::Interrupted),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_err, assert_ready_ok, task};

    #[test]
    fn test_system_clock() {
        let clock = SystemClock;
        let t1 = clock.now_millis();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = clock.now_millis();

        assert!(t1 > 0);
        assert!(t2 >= t1 + 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_waiter_sleeps() {
        let waiter = SleepWaiter::new();
        let mut wait = task::spawn(waiter.wait(Duration::from_millis(500)));
        assert_pending!(wait.poll());

        tokio::time::advance(Duration::from_millis(499)).await;
        assert_pending!(wait.poll());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_ready_ok!(wait.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_aborts_pending_wait() {
        let interrupt = Interrupt::new();
        let waiter = SleepWaiter::with_interrupt(&interrupt);
        let mut wait = task::spawn(waiter.wait(Duration::from_secs(60)));
        assert_pending!(wait.poll());

        interrupt.trigger();
        assert!(wait.is_woken());
        assert_ready_err!(wait.poll());
    }

    #[tokio::test]
    async fn test_interrupt_aborts_future_waits() {
        let interrupt = Interrupt::new();
        let waiter = SleepWaiter::with_interrupt(&interrupt);
        interrupt.trigger();

        assert!(interrupt.is_triggered());
        assert!(matches!(
            waiter.wait(Duration::from_secs(60)).await,
            Err(RateLimitError::Interrupted)
        ));
    }

    #[tokio::test]
    async fn test_dropped_interrupt_still_sleeps() {
        let interrupt = Interrupt::new();
        let waiter = SleepWaiter::with_interrupt(&interrupt);
        drop(interrupt);

        assert!(waiter.wait(Duration::from_millis(1)).await.is_ok());
    }
}
