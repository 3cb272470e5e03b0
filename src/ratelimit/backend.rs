//! Rate limiter trait for abstracting the real and no-op implementations.

use async_trait::async_trait;

use super::entry::EntrySnapshot;
use super::limiter::RateLimiter;
use crate::error::Result;
use crate::sender::Initiator;

/// Trait for rate limiter implementations.
///
/// The HTTP sender holds one of these and calls [`throttle`] before every
/// request, without knowing whether any rule is configured.
///
/// [`throttle`]: RateLimiterBackend::throttle
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Wait as long as needed to respect the limit for `host`, then record
    /// the request. Returns immediately when no rule applies.
    async fn throttle(&self, host: &str, initiator: Initiator) -> Result<()>;

    /// Point-in-time copy of all tracked counters.
    fn entries(&self) -> Vec<EntrySnapshot>;

    /// Whether this limiter can ever delay a request.
    fn is_active(&self) -> bool;
}

/// Limiter installed when no enabled rule exists. It never waits and tracks
/// nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullRateLimiter;

#[async_trait]
impl RateLimiterBackend for NullRateLimiter {
    async fn throttle(&self, _host: &str, _initiator: Initiator) -> Result<()> {
        Ok(())
    }

    fn entries(&self) -> Vec<EntrySnapshot> {
        Vec::new()
    }

    fn is_active(&self) -> bool {
        false
    }
}

#[async_trait]
impl RateLimiterBackend for RateLimiter {
    async fn throttle(&self, host: &str, initiator: Initiator) -> Result<()> {
        RateLimiter::throttle(self, host, initiator).await
    }

    fn entries(&self) -> Vec<EntrySnapshot> {
        RateLimiter::entries(self)
    }

    fn is_active(&self) -> bool {
        true
    }
}
