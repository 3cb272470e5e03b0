//! Rate limiting logic and state management.

mod backend;
mod clock;
mod entry;
mod key;
mod limiter;
pub mod matcher;
#[cfg(any(test, feature = "test-helpers"))]
pub mod mocks;
mod rules;

pub use backend::{NullRateLimiter, RateLimiterBackend};
pub use clock::{Clock, Interrupt, SleepWaiter, SystemClock, Waiter};
pub use entry::{EntrySnapshot, EntryState, RateLimitEntry};
pub use key::RateLimitKey;
pub use limiter::RateLimiter;
pub use rules::{GroupBy, RateLimitRule, RuleConfig, RuleSet, RulesFile};
