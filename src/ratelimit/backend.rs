//! Counter store trait for abstracting in-process and external backends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::key::BucketKey;
use crate::error::{Result, TurnstileError};

/// Storage for per-key counters that expire on their own.
///
/// The limiter reads a counter and then writes it back as two separate
/// calls. Implementations are not required to make that pair atomic, so two
/// concurrent requests for the same key may both read the same value and
/// one increment is lost. Failures, including timeouts, must surface as
/// [`TurnstileError::StoreUnavailable`].
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Return the current value if a live counter exists for `key`.
    async fn get(&self, key: &BucketKey) -> Result<Option<u64>>;

    /// Create or overwrite the counter for `key` and reset its expiry to
    /// `ttl` from now.
    async fn set_with_ttl(&self, key: &BucketKey, value: u64, ttl: Duration) -> Result<()>;
}

#[async_trait]
impl<S: CounterStore + ?Sized> CounterStore for Arc<S> {
    async fn get(&self, key: &BucketKey) -> Result<Option<u64>> {
        (**self).get(key).await
    }

    async fn set_with_ttl(&self, key: &BucketKey, value: u64, ttl: Duration) -> Result<()> {
        (**self).set_with_ttl(key, value, ttl).await
    }
}

/// Bounds every call to an inner store by a fixed deadline.
#[derive(Debug, Clone)]
pub struct TimeoutStore<S> {
    inner: S,
    timeout: Duration,
}

impl<S> TimeoutStore<S> {
    /// Wrap `inner`, failing any operation that takes longer than `timeout`.
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// Get the wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Get the per-operation deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn elapsed(&self, operation: &str, key: &BucketKey) -> TurnstileError {
        warn!(
            key = %key,
            operation = operation,
            timeout = ?self.timeout,
            "Counter store operation timed out"
        );
        TurnstileError::StoreUnavailable(format!(
            "{} timed out after {:?}",
            operation, self.timeout
        ))
    }
}

#[async_trait]
impl<S: CounterStore> CounterStore for TimeoutStore<S> {
    async fn get(&self, key: &BucketKey) -> Result<Option<u64>> {
        tokio::time::timeout(self.timeout, self.inner.get(key))
            .await
            .map_err(|_| self.elapsed("get", key))?
    }

    async fn set_with_ttl(&self, key: &BucketKey, value: u64, ttl: Duration) -> Result<()> {
        tokio::time::timeout(self.timeout, self.inner.set_with_ttl(key, value, ttl))
            .await
            .map_err(|_| self.elapsed("set_with_ttl", key))?
    }
}
