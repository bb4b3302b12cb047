//! Turnstile - Fixed-Window Request Rate Limiting
//!
//! This crate decides whether a request may proceed based on how many
//! requests sharing its key (client address or authenticated principal)
//! were counted within a trailing window. Counters live in a pluggable
//! [`ratelimit::CounterStore`] with per-key expiry; the limiter itself holds
//! no state beyond a handle to that store.
//!
//! Every counted request refreshes the counter's expiry to a full window, so
//! a key that keeps sending requests stays limited until it goes quiet for a
//! whole window. This is a refreshing window, not a calendar-aligned one.

pub mod config;
pub mod error;
pub mod ratelimit;
