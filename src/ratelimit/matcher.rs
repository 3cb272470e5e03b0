//! Host matching for rate limit rules.
//!
//! Regex rules search the host for their pattern. Plain rules compare IP
//! literals exactly and treat everything else as a domain, matching the
//! domain itself and any of its subdomains.

use std::net::{Ipv4Addr, Ipv6Addr};

use super::rules::RateLimitRule;

/// Check whether `rule` applies to `host`, ignoring the enabled flag.
///
/// `host` is expected without a port, with IPv6 literals in brackets.
pub fn matches(rule: &RateLimitRule, host: &str) -> bool {
    if let Some(pattern) = rule.pattern() {
        return pattern.is_match(host);
    }

    let match_string = rule.match_string();
    if is_ip_literal(host) {
        return host == match_string;
    }

    host == match_string
        || host
            .strip_suffix(match_string)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Whether `host` is a dotted-quad IPv4 address or a bracketed IPv6 address.
pub fn is_ip_literal(host: &str) -> bool {
    if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        return inner.parse::<Ipv6Addr>().is_ok();
    }
    host.parse::<Ipv4Addr>().is_ok()
}
