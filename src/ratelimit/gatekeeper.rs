//! Rate limiting by policy name.
//!
//! A [`Gatekeeper`] pairs a [`RateLimiter`] with a [`PolicySet`] that can be
//! swapped at runtime, so hosts refer to policies by name instead of holding
//! [`Policy`] values themselves.

use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use super::backend::CounterStore;
use super::key::RequestIdentity;
use super::limiter::{Decision, Outcome, RateLimiter};
use super::policy::{Policy, PolicySet};
use crate::error::{Result, TurnstileError};

/// A rate limiter bound to a named set of policies.
pub struct Gatekeeper<S> {
    limiter: RateLimiter<S>,
    policies: RwLock<PolicySet>,
}

impl<S: CounterStore> Gatekeeper<S> {
    /// Create a gatekeeper counting in `store`.
    pub fn new(store: Arc<S>, policies: PolicySet) -> Self {
        Self {
            limiter: RateLimiter::new(store),
            policies: RwLock::new(policies),
        }
    }

    /// Replace the policy set.
    ///
    /// Existing counters are kept; they are read against the new limits.
    pub fn set_policies(&self, policies: PolicySet) {
        info!(count = policies.len(), "Replacing rate limit policies");
        *self.policies.write() = policies;
    }

    /// Get a snapshot of the current policy set.
    pub fn policies(&self) -> PolicySet {
        self.policies.read().clone()
    }

    /// Look up a policy by name.
    pub fn policy(&self, name: &str) -> Result<Policy> {
        self.policies
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| TurnstileError::UnknownPolicy(name.to_string()))
    }

    /// Get the underlying rate limiter.
    pub fn limiter(&self) -> &RateLimiter<S> {
        &self.limiter
    }

    /// Count a request against the named policy.
    pub async fn check<R: RequestIdentity + ?Sized>(
        &self,
        name: &str,
        request: &R,
    ) -> Result<Decision> {
        let policy = self.policy(name)?;
        self.limiter.check(request, &policy).await
    }

    /// Run `operation` with `request` if the named policy admits it.
    pub async fn check_and_run<R, F, Fut, T>(
        &self,
        name: &str,
        request: R,
        operation: F,
    ) -> Result<Outcome<T>>
    where
        R: RequestIdentity,
        F: FnOnce(R) -> Fut,
        Fut: Future<Output = T>,
    {
        let policy = self.policy(name)?;
        self.limiter.check_and_run(request, &policy, operation).await
    }
}
