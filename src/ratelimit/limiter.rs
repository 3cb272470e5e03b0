//! Core rate limiter implementation.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

use super::clock::{Clock, SleepWaiter, SystemClock, Waiter};
use super::entry::{EntrySnapshot, RateLimitEntry};
use super::key::RateLimitKey;
use super::rules::{RateLimitRule, RuleConfig, RuleSet};
use crate::error::{RateLimitError, Result};
use crate::sender::Initiator;

/// The rate limiter that manages per-destination counters.
///
/// This struct is thread-safe and can be shared across multiple tasks.
/// Requests resolving to different keys never wait on each other; requests
/// resolving to the same key are spaced out one after another.
pub struct RateLimiter {
    /// Active rules, replaced wholesale on reconfiguration
    rules: RwLock<Arc<RuleSet>>,
    /// Tracked counters indexed by key
    entries: DashMap<RateLimitKey, Arc<RateLimitEntry>>,
    clock: Arc<dyn Clock>,
    waiter: RwLock<Arc<dyn Waiter>>,
}

impl RateLimiter {
    /// Create a rate limiter with no rules, using the system clock and
    /// tokio sleeps.
    pub fn new() -> Self {
        Self::with_time(Arc::new(SystemClock), Arc::new(SleepWaiter::new()))
    }

    /// Create a rate limiter with explicit time sources.
    pub fn with_time(clock: Arc<dyn Clock>, waiter: Arc<dyn Waiter>) -> Self {
        Self {
            rules: RwLock::new(Arc::new(RuleSet::new())),
            entries: DashMap::new(),
            clock,
            waiter: RwLock::new(waiter),
        }
    }

    /// Replace the wait strategy used by subsequent throttles.
    pub fn set_waiter(&self, waiter: Arc<dyn Waiter>) {
        *self.waiter.write() = waiter;
    }

    /// Validate `configs` and make them the active rules.
    ///
    /// Rules that fail validation are left out and returned; every valid rule
    /// in the batch is still applied. Duplicates are dropped silently.
    #[must_use = "rejected rules should be reported"]
    pub fn config_change(&self, configs: &[RuleConfig]) -> Vec<RateLimitError> {
        let (rules, errors) = RuleSet::from_configs(configs);
        self.apply_rules(rules);
        errors
    }

    /// Make an already validated rule set active.
    ///
    /// Counters owned by rules that are gone or disabled are dropped. All
    /// other counters are kept as they are.
    pub fn apply_rules(&self, rules: RuleSet) {
        let rules = Arc::new(rules);
        *self.rules.write() = Arc::clone(&rules);

        let before = self.entries.len();
        self.entries.retain(|key, _| rules.is_enabled(&key.rule));
        let pruned = before.saturating_sub(self.entries.len());

        info!(
            rules = rules.len(),
            enabled = rules.iter().filter(|r| r.is_enabled()).count(),
            pruned = pruned,
            "Rate limit rules updated"
        );
    }

    /// The currently active rules.
    pub fn rules(&self) -> Arc<RuleSet> {
        self.rules.read().clone()
    }

    pub fn has_enabled_rules(&self) -> bool {
        self.rules.read().has_enabled_rules()
    }

    /// The most restrictive enabled rule matching `host`, if any.
    pub fn select_rule(&self, host: &str) -> Option<RateLimitRule> {
        self.rules().select(host).cloned()
    }

    /// Resolve the counter a request to `host` is tracked under, creating it
    /// on first use.
    ///
    /// Hosts resolving to the same key always get the same entry.
    pub fn get_or_create(&self, host: &str) -> Option<(Arc<RateLimitEntry>, RateLimitRule)> {
        let rule = self.select_rule(host)?;
        let entry = self.track(&rule, host)?;
        Some((entry, rule))
    }

    /// Get or insert the entry for `host` under `rule`.
    ///
    /// `rule` may have been selected before a reconfiguration removed or
    /// disabled it. An entry inserted after that reconfiguration pruned is
    /// taken out again and `None` is returned.
    fn track(&self, rule: &RateLimitRule, host: &str) -> Option<Arc<RateLimitEntry>> {
        let key = RateLimitKey::new(rule, host);

        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(key = %key, host = host, "Creating new rate limit entry");
                Arc::new(RateLimitEntry::new(key.clone()))
            })
            .value()
            .clone();

        if !self.rules().is_enabled(&key.rule) {
            self.entries.remove_if(&key, |_, existing| Arc::ptr_eq(existing, &entry));
            debug!(key = %key, "Dropped entry for a rule that is no longer active");
            return None;
        }

        Some(entry)
    }

    /// Wait as long as needed to respect the limit for `host`, then record
    /// the request.
    ///
    /// If the wait is interrupted the error is returned and nothing is
    /// recorded. Dropping the returned future has the same effect.
    pub async fn throttle(&self, host: &str, initiator: Initiator) -> Result<()> {
        let Some((entry, rule)) = self.get_or_create(host) else {
            trace!(host = host, initiator = %initiator, "No rate limit rule applies");
            return Ok(());
        };

        let _turn = entry.lock_turnstile().await;
        let waiter = self.waiter.read().clone();

        let mut now = self.clock.now_millis();
        let last = entry.state().last_request_time;
        if last != 0 {
            let elapsed = now.saturating_sub(last);
            let min_interval = rule.min_interval_millis();
            if elapsed < min_interval {
                let delay = min_interval - elapsed;
                debug!(
                    key = %entry.key(),
                    host = host,
                    initiator = %initiator,
                    delay_ms = delay,
                    "Throttling request"
                );
                if let Err(e) = waiter.wait(Duration::from_millis(delay)).await {
                    debug!(key = %entry.key(), host = host, error = %e, "Throttle wait aborted");
                    return Err(e);
                }
                now = self.clock.now_millis();
            }
        }

        entry.record_request(now);
        trace!(key = %entry.key(), host = host, "Request recorded");
        Ok(())
    }

    /// Point-in-time copy of all tracked counters, ordered by key.
    pub fn entries(&self) -> Vec<EntrySnapshot> {
        let live: Vec<Arc<RateLimitEntry>> =
            self.entries.iter().map(|e| Arc::clone(e.value())).collect();
        let mut snapshots: Vec<EntrySnapshot> = live.iter().map(|e| e.snapshot()).collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    /// Get the number of tracked counters.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
