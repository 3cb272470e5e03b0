//! Per-key request tracking.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::key::RateLimitKey;

/// Timing state of one counter. A timestamp of 0 means "not yet set".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryState {
    /// Epoch millis of the first recorded request
    pub first_request_time: u64,
    /// Epoch millis of the most recent recorded request
    pub last_request_time: u64,
    pub request_count: u64,
}

impl EntryState {
    /// Record a request dispatched at `now`.
    pub fn record_request(&mut self, now: u64) {
        if self.first_request_time == 0 {
            self.first_request_time = now;
        }
        self.last_request_time = now;
        self.request_count += 1;
    }
}

/// A tracked counter for one [`RateLimitKey`].
///
/// The state lock is only held for short reads and writes. Callers that need
/// to serialize a whole read-wait-record sequence take the turnstile first,
/// which is never touched by snapshot readers.
#[derive(Debug)]
pub struct RateLimitEntry {
    key: RateLimitKey,
    turnstile: tokio::sync::Mutex<()>,
    state: Mutex<EntryState>,
}

impl RateLimitEntry {
    /// Create a zero-valued entry.
    pub fn new(key: RateLimitKey) -> Self {
        Self {
            key,
            turnstile: tokio::sync::Mutex::new(()),
            state: Mutex::new(EntryState::default()),
        }
    }

    pub fn key(&self) -> &RateLimitKey {
        &self.key
    }

    /// Acquire exclusive use of this entry for a throttle sequence.
    pub(crate) async fn lock_turnstile(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.turnstile.lock().await
    }

    /// Copy of the current timing state.
    pub fn state(&self) -> EntryState {
        *self.state.lock()
    }

    /// Record a request dispatched at `now`.
    pub fn record_request(&self, now: u64) {
        self.state.lock().record_request(now);
    }

    /// Point-in-time view of this entry.
    pub fn snapshot(&self) -> EntrySnapshot {
        let state = self.state();
        EntrySnapshot {
            key: self.key.clone(),
            first_request_time: state.first_request_time,
            last_request_time: state.last_request_time,
            request_count: state.request_count,
        }
    }
}

/// Read-only copy of an entry, for diagnostics and UI feeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySnapshot {
    pub key: RateLimitKey,
    pub first_request_time: u64,
    pub last_request_time: u64,
    pub request_count: u64,
}

impl EntrySnapshot {
    /// Observed requests per second between the first and last request.
    ///
    /// Returns `None` while there is not enough history to tell.
    pub fn effective_rate(&self) -> Option<f64> {
        let span = self.last_request_time.saturating_sub(self.first_request_time);
        if self.request_count == 0 || span == 0 {
            return None;
        }
        Some(self.request_count as f64 * 1000.0 / span as f64)
    }

    pub fn first_request_at(&self) -> Option<DateTime<Utc>> {
        to_datetime(self.first_request_time)
    }

    pub fn last_request_at(&self) -> Option<DateTime<Utc>> {
        to_datetime(self.last_request_time)
    }
}

fn to_datetime(millis: u64) -> Option<DateTime<Utc>> {
    if millis == 0 {
        return None;
    }
    i64::try_from(millis).ok().and_then(DateTime::<Utc>::from_timestamp_millis)
}

impl std::fmt::Display for EntrySnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fmt_time = |t: Option<DateTime<Utc>>| {
            t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
        };
        let rate = self
            .effective_rate()
            .map(|r| format!("{:.2}/s", r))
            .unwrap_or_else(|| "unknown".to_string());

        write!(
            f,
            "{} requests={} first={} last={} rate={}",
            self.key,
            self.request_count,
            fmt_time(self.first_request_at()),
            fmt_time(self.last_request_at()),
            rate
        )
    }
}
