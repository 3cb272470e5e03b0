//! Installs the right limiter on the HTTP sender as rules change.
//!
//! The installer keeps a single long-lived [`RateLimiter`] so counters survive
//! while it is swapped out for the [`NullRateLimiter`] and back.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{RateLimitError, Result};
use crate::ratelimit::{
    NullRateLimiter, RateLimitRule, RateLimiter, RateLimiterBackend, RuleConfig, RuleSet,
    RulesFile,
};
use crate::sender::HttpSender;

/// Callback notified with the limiter installed on the sender.
pub type LimiterObserver = Arc<dyn Fn(Arc<dyn RateLimiterBackend>) + Send + Sync>;

/// Swaps between the real and the no-op limiter on an [`HttpSender`].
pub struct LimiterInstaller {
    sender: Arc<HttpSender>,
    limiter: Arc<RateLimiter>,
    null: Arc<dyn RateLimiterBackend>,
    observer: Mutex<Option<LimiterObserver>>,
    /// Serializes rule edits so concurrent edits never lose each other
    edits: Mutex<()>,
}

impl LimiterInstaller {
    /// Create an installer for `sender` backed by `limiter`.
    ///
    /// Nothing is installed until the first [`apply`](Self::apply).
    pub fn new(sender: Arc<HttpSender>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            sender,
            limiter,
            null: Arc::new(NullRateLimiter),
            observer: Mutex::new(None),
            edits: Mutex::new(()),
        }
    }

    /// The real limiter, whether or not it is currently installed.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// The limiter currently installed on the sender.
    pub fn installed(&self) -> Arc<dyn RateLimiterBackend> {
        self.sender.rate_limiter()
    }

    /// Reconfigure the limiter and install whichever implementation the new
    /// rules call for. Returns the rules that were rejected.
    pub fn apply(&self, configs: &[RuleConfig]) -> Vec<RateLimitError> {
        let _edit = self.edits.lock();
        let errors = self.limiter.config_change(configs);
        self.install();
        errors
    }

    /// The configured rules, in declaration order.
    pub fn rules(&self) -> Vec<RuleConfig> {
        self.limiter.rules().iter().map(|r| r.config().clone()).collect()
    }

    /// Validate and append a rule.
    ///
    /// Fails with [`RateLimitError::RuleExists`] when its description or
    /// match string is already taken.
    pub fn add_rule(&self, config: RuleConfig) -> Result<()> {
        let rule = RateLimitRule::new(config)?;
        self.edit(|rules| {
            let description = rule.description().to_string();
            if rules.add(rule) {
                Ok(())
            } else {
                Err(RateLimitError::RuleExists(description))
            }
        })
    }

    /// Remove the rule with this description, dropping its counters.
    pub fn remove_rule(&self, description: &str) -> Result<()> {
        self.edit(|rules| {
            if rules.remove(description) {
                Ok(())
            } else {
                Err(RateLimitError::RuleNotFound(description.to_string()))
            }
        })
    }

    /// Enable or disable the rule with this description. Disabling drops
    /// its counters.
    pub fn set_rule_enabled(&self, description: &str, enabled: bool) -> Result<()> {
        self.edit(|rules| {
            if rules.set_enabled(description, enabled) {
                Ok(())
            } else {
                Err(RateLimitError::RuleNotFound(description.to_string()))
            }
        })
    }

    /// Apply `change` to a copy of the active rules and, if it succeeds,
    /// make the copy active.
    fn edit<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut RuleSet) -> Result<()>,
    {
        let _edit = self.edits.lock();
        let mut rules = RuleSet::clone(&self.limiter.rules());
        change(&mut rules)?;
        self.limiter.apply_rules(rules);
        self.install();
        Ok(())
    }

    fn install(&self) {
        let next: Arc<dyn RateLimiterBackend> = if self.limiter.has_enabled_rules() {
            Arc::clone(&self.limiter) as Arc<dyn RateLimiterBackend>
        } else {
            Arc::clone(&self.null)
        };

        let previous = self.sender.set_rate_limiter(Arc::clone(&next));
        if !Arc::ptr_eq(&previous, &next) {
            info!(active = next.is_active(), "Installed rate limiter on sender");
            self.notify(next);
        }
    }

    /// Register the observer, replacing any previous one, or clear it with
    /// `None`.
    ///
    /// A new observer is notified straight away with the installed limiter.
    /// It runs while rule edits are locked, so it must not edit rules.
    pub fn set_observer(&self, observer: Option<LimiterObserver>) {
        *self.observer.lock() = observer.clone();
        if let Some(observer) = observer {
            observer(self.installed());
        }
    }

    fn notify(&self, limiter: Arc<dyn RateLimiterBackend>) {
        // Clone out so the callback runs without the lock held.
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer(limiter);
        }
    }

    /// Re-read `path` every `interval` and apply it when its rules changed.
    ///
    /// Read or parse failures are logged and leave the current rules active.
    pub fn spawn_reload(self: Arc<Self>, path: PathBuf, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; the caller already loaded.
            ticker.tick().await;

            let mut current: Option<RulesFile> = None;
            loop {
                ticker.tick().await;
                current = self.reload_if_changed(&path, current);
            }
        })
    }

    fn reload_if_changed(&self, path: &Path, current: Option<RulesFile>) -> Option<RulesFile> {
        let loaded = match RulesFile::from_file(path) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to reload rate limit rules");
                return current;
            }
        };

        if current.as_ref() == Some(&loaded) {
            debug!(path = %path.display(), "Rate limit rules unchanged");
            return current;
        }

        for error in self.apply(&loaded.rules) {
            warn!(error = %error, "Rejected rate limit rule on reload");
        }
        Some(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{EntrySnapshot, GroupBy};
    use crate::sender::Initiator;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn installer() -> LimiterInstaller {
        LimiterInstaller::new(Arc::new(HttpSender::new()), Arc::new(RateLimiter::new()))
    }

    fn rule(enabled: bool) -> RuleConfig {
        RuleConfig::new("example", "example.com", 1000.0, GroupBy::Rule).enabled(enabled)
    }

    fn counting_observer() -> (LimiterObserver, Arc<AtomicUsize>, Arc<Mutex<Vec<bool>>>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (c, s) = (Arc::clone(&calls), Arc::clone(&seen));
        let observer: LimiterObserver = Arc::new(move |limiter: Arc<dyn RateLimiterBackend>| {
            c.fetch_add(1, Ordering::SeqCst);
            s.lock().push(limiter.is_active());
        });
        (observer, calls, seen)
    }

    #[test]
    fn test_installs_real_limiter_only_with_enabled_rules() {
        let installer = installer();

        assert!(installer.apply(&[rule(false)]).is_empty());
        assert!(!installer.installed().is_active());

        assert!(installer.apply(&[rule(true)]).is_empty());
        assert!(installer.installed().is_active());

        assert!(installer.apply(&[]).is_empty());
        assert!(!installer.installed().is_active());
    }

    #[test]
    fn test_apply_reports_rejected_rules() {
        let installer = installer();
        let errors = installer.apply(&[
            rule(true),
            RuleConfig::new("bad", "(", 1.0, GroupBy::Rule).regex(),
        ]);
        assert_eq!(errors.len(), 1);
        assert!(installer.installed().is_active());
    }

    #[test]
    fn test_observer_notified_on_register_and_swap() {
        let installer = installer();
        let (observer, calls, seen) = counting_observer();

        installer.set_observer(Some(observer));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        installer.apply(&[rule(true)]);
        // Same implementation stays installed, so no notification
        installer.apply(&[rule(true)]);
        installer.apply(&[rule(false)]);

        assert_eq!(*seen.lock(), vec![false, true, false]);
    }

    #[test]
    fn test_clearing_observer_is_silent() {
        let installer = installer();
        let (observer, calls, _seen) = counting_observer();

        installer.set_observer(Some(observer));
        installer.set_observer(None);
        installer.apply(&[rule(true)]);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reapply_prunes_only_disabled_rule_entries() {
        let installer = installer();
        let other = RuleConfig::new("other", "other.com", 1000.0, GroupBy::Rule);
        installer.apply(&[rule(true), other.clone()]);

        installer
            .installed()
            .throttle("www.example.com", Initiator::Proxy)
            .await
            .unwrap();
        installer
            .installed()
            .throttle("other.com", Initiator::Proxy)
            .await
            .unwrap();

        installer.apply(&[rule(true), other.enabled(false)]);

        let entries: Vec<EntrySnapshot> = installer.limiter().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key.rule, "example");
        assert_eq!(entries[0].request_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_applies_changed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.yaml");
        std::fs::write(&path, "rules: []\n").unwrap();

        let installer = Arc::new(installer());
        let handle = Arc::clone(&installer).spawn_reload(path.clone(), Duration::from_secs(5));

        std::fs::write(
            &path,
            "rules:\n  - description: example\n    matchString: example.com\n    requestsPerSecond: 2\n",
        )
        .unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(installer.installed().is_active());
        assert_eq!(installer.limiter().rules().len(), 1);

        // A broken file keeps the last good rules
        std::fs::write(&path, "rules: [").unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(installer.installed().is_active());

        handle.abort();
    }

    #[tokio::test]
    async fn test_rule_edits_reapply_rules() {
        let installer = installer();
        let (observer, _calls, seen) = counting_observer();
        installer.set_observer(Some(observer));

        installer.add_rule(rule(true)).unwrap();
        installer
            .add_rule(RuleConfig::new("other", "other.com", 1000.0, GroupBy::Host))
            .unwrap();
        assert!(installer.installed().is_active());
        let listed: Vec<String> = installer.rules().into_iter().map(|r| r.description).collect();
        assert_eq!(listed, vec!["example", "other"]);

        installer
            .installed()
            .throttle("www.example.com", Initiator::Proxy)
            .await
            .unwrap();
        installer
            .installed()
            .throttle("other.com", Initiator::Proxy)
            .await
            .unwrap();

        installer.set_rule_enabled("example", false).unwrap();
        let remaining: Vec<String> =
            installer.limiter().entries().into_iter().map(|e| e.key.rule).collect();
        assert_eq!(remaining, vec!["other"]);
        assert!(!installer.rules()[0].enabled);

        installer.remove_rule("other").unwrap();
        assert_eq!(installer.limiter().entry_count(), 0);
        assert!(!installer.installed().is_active());

        installer.set_rule_enabled("example", true).unwrap();
        assert!(installer.installed().is_active());
        assert_eq!(*seen.lock(), vec![false, true, false, true]);
    }

    #[test]
    fn test_rule_edits_report_missing_and_duplicate_rules() {
        let installer = installer();
        installer.add_rule(rule(true)).unwrap();

        assert!(matches!(
            installer.add_rule(RuleConfig::new("example", "new.com", 1.0, GroupBy::Rule)),
            Err(RateLimitError::RuleExists(ref r)) if r == "example"
        ));
        assert!(matches!(
            installer.add_rule(RuleConfig::new("new", "example.com", 1.0, GroupBy::Rule)),
            Err(RateLimitError::RuleExists(_))
        ));
        assert!(matches!(
            installer.add_rule(RuleConfig::new("bad", "(", 1.0, GroupBy::Rule).regex()),
            Err(RateLimitError::InvalidRegex { .. })
        ));
        assert!(matches!(
            installer.remove_rule("missing"),
            Err(RateLimitError::RuleNotFound(ref r)) if r == "missing"
        ));
        assert!(matches!(
            installer.set_rule_enabled("missing", false),
            Err(RateLimitError::RuleNotFound(_))
        ));

        assert_eq!(installer.rules(), vec![rule(true)]);
        assert!(installer.installed().is_active());
    }
}
