//! Rate limit rules configuration and validation.
//!
//! Rules arrive as plain [`RuleConfig`] values (from a rules file or an
//! options editor) and are validated into [`RateLimitRule`]s, compiling any
//! regex once. A [`RuleSet`] keeps validated rules in declaration order and
//! drops duplicates.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

use super::matcher;
use crate::error::{RateLimitError, Result};

/// Counter granularity for a rule.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum GroupBy {
    /// All hosts matching the rule share one counter.
    #[default]
    #[serde(alias = "rule")]
    Rule,
    /// Each distinct matching host gets its own counter.
    #[serde(alias = "host")]
    Host,
}

impl fmt::Display for GroupBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupBy::Rule => write!(f, "RULE"),
            GroupBy::Host => write!(f, "HOST"),
        }
    }
}

/// A rule exactly as it is persisted or edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConfig {
    /// Human label, also the rule's identity
    pub description: String,
    /// Domain, IP literal, or regex (when `match_regex` is set)
    pub match_string: String,
    #[serde(default)]
    pub match_regex: bool,
    /// Enforced ceiling
    pub requests_per_second: f64,
    #[serde(default)]
    pub group_by: GroupBy,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RuleConfig {
    /// Create an enabled, non-regex rule.
    pub fn new(
        description: impl Into<String>,
        match_string: impl Into<String>,
        requests_per_second: f64,
        group_by: GroupBy,
    ) -> Self {
        Self {
            description: description.into(),
            match_string: match_string.into(),
            match_regex: false,
            requests_per_second,
            group_by,
            enabled: true,
        }
    }

    /// Mark the match string as a regular expression.
    pub fn regex(mut self) -> Self {
        self.match_regex = true;
        self
    }

    /// Set the enabled flag.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// A validated rule, immutable once built.
#[derive(Debug, Clone)]
pub struct RateLimitRule {
    config: RuleConfig,
    pattern: Option<Regex>,
}

impl RateLimitRule {
    /// Validate a rule, compiling its pattern if it is a regex rule.
    pub fn new(config: RuleConfig) -> Result<Self> {
        let invalid = |reason: &str| RateLimitError::InvalidRule {
            rule: config.description.clone(),
            reason: reason.to_string(),
        };

        if config.description.trim().is_empty() {
            return Err(invalid("description must not be empty"));
        }
        if config.match_string.is_empty() {
            return Err(invalid("match string must not be empty"));
        }
        if !config.requests_per_second.is_finite() || config.requests_per_second <= 0.0 {
            return Err(invalid("requests per second must be a positive number"));
        }

        let pattern = if config.match_regex {
            let source = expand_literal_quotes(&config.match_string);
            let regex = Regex::new(&source).map_err(|source| RateLimitError::InvalidRegex {
                rule: config.description.clone(),
                source,
            })?;
            Some(regex)
        } else {
            None
        };

        Ok(Self { config, pattern })
    }

    pub fn description(&self) -> &str {
        &self.config.description
    }

    pub fn match_string(&self) -> &str {
        &self.config.match_string
    }

    pub fn requests_per_second(&self) -> f64 {
        self.config.requests_per_second
    }

    pub fn group_by(&self) -> GroupBy {
        self.config.group_by
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// The compiled pattern, present only for regex rules.
    pub fn pattern(&self) -> Option<&Regex> {
        self.pattern.as_ref()
    }

    /// The configuration this rule was built from.
    pub fn config(&self) -> &RuleConfig {
        &self.config
    }

    /// A copy of this rule with the enabled flag set to `enabled`.
    pub fn with_enabled(&self, enabled: bool) -> Self {
        let mut rule = self.clone();
        rule.config.enabled = enabled;
        rule
    }

    /// Minimum spacing between two requests counted against this rule, in
    /// milliseconds.
    pub fn min_interval_millis(&self) -> u64 {
        (1000.0 / self.config.requests_per_second) as u64
    }

    /// Whether this rule applies to `host`. Disabled rules never match.
    pub fn matches(&self, host: &str) -> bool {
        self.is_enabled() && matcher::matches(self, host)
    }
}

/// Expand Java-style `\Q...\E` literal spans into escaped regex text.
///
/// An unterminated `\Q` quotes the remainder of the pattern.
fn expand_literal_quotes(pattern: &str) -> Cow<'_, str> {
    if !pattern.contains("\\Q") {
        return Cow::Borrowed(pattern);
    }

    let mut out = String::with_capacity(pattern.len() + 8);
    let mut rest = pattern;
    while let Some(idx) = rest.find('\\') {
        out.push_str(&rest[..idx]);
        let tail = &rest[idx..];
        if let Some(quoted) = tail.strip_prefix("\\Q") {
            let (literal, after) = match quoted.find("\\E") {
                Some(end) => (&quoted[..end], &quoted[end + 2..]),
                None => (quoted, ""),
            };
            out.push_str(&regex::escape(literal));
            rest = after;
        } else {
            // Copy the escape and the escaped char verbatim so `\\Q` stays literal.
            let escaped_len = tail[1..].chars().next().map_or(0, char::len_utf8);
            out.push_str(&tail[..1 + escaped_len]);
            rest = &tail[1 + escaped_len..];
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}

/// Insertion-ordered collection of validated rules without duplicates.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<RateLimitRule>,
}

impl RuleSet {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and add each config in order.
    ///
    /// Invalid rules are skipped and returned; duplicates are skipped
    /// silently. Valid rules in the same batch are always kept.
    pub fn from_configs<'a, I>(configs: I) -> (Self, Vec<RateLimitError>)
    where
        I: IntoIterator<Item = &'a RuleConfig>,
    {
        let mut set = Self::new();
        let mut errors = Vec::new();
        for config in configs {
            match RateLimitRule::new(config.clone()) {
                Ok(rule) => {
                    set.add(rule);
                }
                Err(e) => {
                    warn!(rule = %config.description, error = %e, "Rejecting rate limit rule");
                    errors.push(e);
                }
            }
        }
        (set, errors)
    }

    /// Add a rule unless one with the same description or match string is
    /// already present. Returns whether the rule was added.
    pub fn add(&mut self, rule: RateLimitRule) -> bool {
        let duplicate = self.rules.iter().any(|existing| {
            existing.description() == rule.description()
                || existing.match_string() == rule.match_string()
        });
        if duplicate {
            debug!(rule = %rule.description(), "Ignoring duplicate rate limit rule");
            return false;
        }
        debug!(
            rule = %rule.description(),
            group_by = %rule.group_by(),
            requests_per_second = rule.requests_per_second(),
            "Added rate limit rule"
        );
        self.rules.push(rule);
        true
    }

    /// Find a rule by its description.
    pub fn get(&self, description: &str) -> Option<&RateLimitRule> {
        self.rules.iter().find(|r| r.description() == description)
    }

    /// Remove the rule with this description. Returns whether one was found.
    pub fn remove(&mut self, description: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.description() != description);
        self.rules.len() != before
    }

    /// Enable or disable the rule with this description, keeping its
    /// position. Returns whether one was found.
    pub fn set_enabled(&mut self, description: &str, enabled: bool) -> bool {
        match self.rules.iter_mut().find(|r| r.description() == description) {
            Some(rule) => {
                *rule = rule.with_enabled(enabled);
                true
            }
            None => false,
        }
    }

    /// Whether a rule with this description exists and is enabled.
    pub fn is_enabled(&self, description: &str) -> bool {
        self.get(description).is_some_and(RateLimitRule::is_enabled)
    }

    pub fn has_enabled_rules(&self) -> bool {
        self.rules.iter().any(RateLimitRule::is_enabled)
    }

    /// Pick the most restrictive enabled rule matching `host`.
    ///
    /// The lowest requests-per-second wins; on a tie the earliest declared
    /// rule wins.
    pub fn select(&self, host: &str) -> Option<&RateLimitRule> {
        self.rules
            .iter()
            .filter(|rule| rule.matches(host))
            .fold(None, |best: Option<&RateLimitRule>, rule| match best {
                Some(b) if b.requests_per_second() <= rule.requests_per_second() => Some(b),
                _ => Some(rule),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &RateLimitRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// On-disk rules file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RulesFile {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl RulesFile {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RateLimitError::Config(format!("Failed to parse rate limit rules: {}", e)))
    }
}
