//! Keys identifying tracked rate limit counters.

use serde::Serialize;

use super::rules::{GroupBy, RateLimitRule};

/// A key that uniquely identifies one tracked counter.
///
/// The key is the owning rule's description plus a group discriminator:
/// the description again for rule-grouped rules, or the destination host
/// for host-grouped rules.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RateLimitKey {
    /// Description of the rule owning this counter
    pub rule: String,
    /// Grouping discriminator
    pub group: String,
    /// How the owning rule groups requests
    pub group_by: GroupBy,
}

impl RateLimitKey {
    /// Create the key a request to `host` is counted under for `rule`.
    pub fn new(rule: &RateLimitRule, host: &str) -> Self {
        let group = match rule.group_by() {
            GroupBy::Rule => rule.description(),
            GroupBy::Host => host,
        };

        Self {
            rule: rule.description().to_string(),
            group: group.to_string(),
            group_by: rule.group_by(),
        }
    }

    /// Whether this key counts every host of its rule together.
    pub fn is_rule_grouped(&self) -> bool {
        self.group_by == GroupBy::Rule
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_rule_grouped() {
            write!(f, "{}", self.rule)
        } else {
            write!(f, "{} [{}]", self.rule, self.group)
        }
    }
}
