//! In-process expiring counter store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::backend::CounterStore;
use super::key::BucketKey;
use crate::error::Result;

/// Expiry used when `now + ttl` is not representable, roughly 30 years out.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// A counter value together with the instant it stops being live.
#[derive(Debug, Clone, Copy)]
struct ExpiringCounter {
    value: u64,
    expires_at: Instant,
}

impl ExpiringCounter {
    fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// A [`CounterStore`] backed by a concurrent in-process map.
///
/// Expired counters are invisible to readers as soon as their deadline
/// passes. They are dropped lazily on read, or in bulk by
/// [`MemoryStore::purge_expired`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    counters: DashMap<BucketKey, ExpiringCounter>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every expired counter, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        self.counters.retain(|_, counter| {
            let live = !counter.is_expired_at(now);
            if !live {
                purged += 1;
            }
            live
        });
        purged
    }

    /// Time left before the counter for `key` expires.
    ///
    /// Returns `None` if no live counter exists for the key.
    pub fn time_to_live(&self, key: &BucketKey) -> Option<Duration> {
        let now = Instant::now();
        self.counters
            .get(key)
            .filter(|counter| !counter.is_expired_at(now))
            .map(|counter| counter.expires_at - now)
    }

    /// Get the number of stored counters, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Check whether the store holds no counters.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Clear all counters.
    pub fn clear(&self) {
        self.counters.clear();
    }

    /// Spawn a background task purging expired counters every `period`.
    ///
    /// The task runs until the returned handle is aborted or the runtime
    /// shuts down.
    pub fn spawn_sweeper(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let purged = self.purge_expired();
                if purged > 0 {
                    debug!(purged = purged, remaining = self.len(), "Purged expired counters");
                }
            }
        })
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &BucketKey) -> Result<Option<u64>> {
        let now = Instant::now();

        if self
            .counters
            .remove_if(key, |_, counter| counter.is_expired_at(now))
            .is_some()
        {
            trace!(key = %key, "Counter expired");
            return Ok(None);
        }

        Ok(self.counters.get(key).map(|counter| counter.value))
    }

    async fn set_with_ttl(&self, key: &BucketKey, value: u64, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let expires_at = now.checked_add(ttl).unwrap_or_else(|| now + FAR_FUTURE);
        let counter = ExpiringCounter { value, expires_at };
        self.counters.insert(key.clone(), counter);
        Ok(())
    }
}
