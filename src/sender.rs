//! The HTTP sender boundary.
//!
//! [`HttpSender`] owns the slot holding the active limiter. Before every
//! request it resolves the destination host and throttles on it; the
//! installer swaps the limiter in the slot when the configuration changes.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;
use url::{Host, Url};

use crate::error::{RateLimitError, Result};
use crate::ratelimit::{NullRateLimiter, RateLimiterBackend};

/// The component that originated a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Initiator {
    Proxy,
    ActiveScanner,
    Spider,
    Fuzzer,
    Authentication,
    ManualRequest,
    AjaxSpider,
    ForcedBrowse,
    /// Update checks; never throttled
    CheckForUpdates,
    Other,
}

impl Initiator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Initiator::Proxy => "proxy",
            Initiator::ActiveScanner => "active_scanner",
            Initiator::Spider => "spider",
            Initiator::Fuzzer => "fuzzer",
            Initiator::Authentication => "authentication",
            Initiator::ManualRequest => "manual_request",
            Initiator::AjaxSpider => "ajax_spider",
            Initiator::ForcedBrowse => "forced_browse",
            Initiator::CheckForUpdates => "check_for_updates",
            Initiator::Other => "other",
        }
    }
}

impl fmt::Display for Initiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Initiator {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self> {
        let initiator = match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "proxy" => Initiator::Proxy,
            "active_scanner" => Initiator::ActiveScanner,
            "spider" => Initiator::Spider,
            "fuzzer" => Initiator::Fuzzer,
            "authentication" => Initiator::Authentication,
            "manual_request" => Initiator::ManualRequest,
            "ajax_spider" => Initiator::AjaxSpider,
            "forced_browse" => Initiator::ForcedBrowse,
            "check_for_updates" => Initiator::CheckForUpdates,
            "other" => Initiator::Other,
            other => {
                return Err(RateLimitError::Config(format!("Unknown initiator: {}", other)));
            }
        };
        Ok(initiator)
    }
}

/// The host a request to `url` is throttled on: no port, and IPv6 literals
/// in brackets.
pub fn destination_host(url: &Url) -> Option<String> {
    match url.host()? {
        Host::Domain(domain) => Some(domain.to_string()),
        Host::Ipv4(addr) => Some(addr.to_string()),
        Host::Ipv6(addr) => Some(format!("[{}]", addr)),
    }
}

/// Shared HTTP sender state relevant to throttling.
pub struct HttpSender {
    rate_limiter: RwLock<Arc<dyn RateLimiterBackend>>,
}

impl HttpSender {
    /// Create a sender with the no-op limiter installed.
    pub fn new() -> Self {
        Self {
            rate_limiter: RwLock::new(Arc::new(NullRateLimiter)),
        }
    }

    /// Install `limiter`, returning the one it replaces.
    pub fn set_rate_limiter(
        &self,
        limiter: Arc<dyn RateLimiterBackend>,
    ) -> Arc<dyn RateLimiterBackend> {
        std::mem::replace(&mut *self.rate_limiter.write(), limiter)
    }

    /// The currently installed limiter.
    pub fn rate_limiter(&self) -> Arc<dyn RateLimiterBackend> {
        self.rate_limiter.read().clone()
    }

    /// Throttle a request to `url` before it is dispatched.
    ///
    /// URLs without a host (e.g. `data:`) and update checks are never
    /// throttled.
    pub async fn before_send(&self, url: &Url, initiator: Initiator) -> Result<()> {
        if initiator == Initiator::CheckForUpdates {
            debug!(url = %url, "Update check, not throttling");
            return Ok(());
        }
        let Some(host) = destination_host(url) else {
            debug!(url = %url, "Request has no host, not throttling");
            return Ok(());
        };
        let limiter = self.rate_limiter();
        limiter.throttle(&host, initiator).await
    }
}

impl Default for HttpSender {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{GroupBy, RateLimiter, RuleConfig};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_destination_host() {
        assert_eq!(
            destination_host(&url("https://www.example.com:8443/path")).as_deref(),
            Some("www.example.com")
        );
        assert_eq!(
            destination_host(&url("http://192.168.1.1:8080/")).as_deref(),
            Some("192.168.1.1")
        );
        assert_eq!(destination_host(&url("http://[::1]:8080/")).as_deref(), Some("[::1]"));
        assert_eq!(destination_host(&url("data:text/plain,hi")), None);
    }

    #[test]
    fn test_initiator_round_trip() {
        for initiator in [
            Initiator::Proxy,
            Initiator::ActiveScanner,
            Initiator::AjaxSpider,
            Initiator::CheckForUpdates,
            Initiator::Other,
        ] {
            assert_eq!(initiator.to_string().parse::<Initiator>().unwrap(), initiator);
        }
        assert_eq!("Active-Scanner".parse::<Initiator>().unwrap(), Initiator::ActiveScanner);
        assert!("robot".parse::<Initiator>().is_err());
    }

    #[tokio::test]
    async fn test_sender_starts_with_null_limiter() {
        let sender = HttpSender::new();
        assert!(!sender.rate_limiter().is_active());
        sender
            .before_send(&url("http://example.com/"), Initiator::Proxy)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_set_rate_limiter_swaps() {
        let sender = HttpSender::new();
        let limiter = Arc::new(RateLimiter::new());
        let errors = limiter.config_change(&[RuleConfig::new(
            "local",
            "[::1]",
            1000.0,
            GroupBy::Host,
        )]);
        assert!(errors.is_empty());

        let previous = sender.set_rate_limiter(limiter.clone());
        assert!(!previous.is_active());

        sender
            .before_send(&url("http://[::1]:8080/a"), Initiator::Spider)
            .await
            .unwrap();
        sender
            .before_send(&url("http://[::2]:8080/a"), Initiator::Spider)
            .await
            .unwrap();

        let entries = limiter.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key.group, "[::1]");
    }

    #[tokio::test]
    async fn test_update_checks_are_not_throttled() {
        let sender = HttpSender::new();
        let limiter = Arc::new(RateLimiter::new());
        let errors = limiter.config_change(&[RuleConfig::new(
            "updates",
            "example.com",
            1.0,
            GroupBy::Rule,
        )]);
        assert!(errors.is_empty());
        sender.set_rate_limiter(limiter.clone());

        for _ in 0..3 {
            sender
                .before_send(&url("https://example.com/check"), Initiator::CheckForUpdates)
                .await
                .unwrap();
        }
        assert_eq!(limiter.entry_count(), 0);

        sender
            .before_send(&url("https://example.com/check"), Initiator::ManualRequest)
            .await
            .unwrap();
        assert_eq!(limiter.entry_count(), 1);
    }
}
