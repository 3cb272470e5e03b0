//! Sender Ratelimit - Outbound Request Throttling
//!
//! This crate throttles the requests an HTTP client sends, per destination,
//! according to operator-configured rules. It is meant to sit in front of the
//! dispatch step of a scanning client so that automated traffic does not
//! overwhelm the servers being tested.

pub mod config;
pub mod error;
pub mod installer;
pub mod ratelimit;
pub mod sender;
