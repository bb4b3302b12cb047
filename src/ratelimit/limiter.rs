//! Core rate limiter implementation.

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::backend::CounterStore;
use super::key::{BucketKey, RequestIdentity};
use super::policy::Policy;
use crate::error::Result;

/// The result of counting a request against a policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The request was counted; `count` is the counter value after it.
    Allowed { count: u64 },
    /// The bucket was already full; `count` is the untouched counter value.
    Denied {
        count: u64,
        redirect_target: Option<String>,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Counter value observed for the request's bucket.
    pub fn count(&self) -> u64 {
        match self {
            Decision::Allowed { count } | Decision::Denied { count, .. } => *count,
        }
    }
}

/// The result of a guarded operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The operation ran and produced this value.
    Allowed(T),
    /// The operation was not run. Adapters turn this into a redirect to
    /// `redirect_target` when present, or a generic rejection otherwise.
    Denied { redirect_target: Option<String> },
}

impl<T> Outcome<T> {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Outcome::Allowed(_))
    }

    /// Get the operation's output if it ran.
    pub fn into_allowed(self) -> Option<T> {
        match self {
            Outcome::Allowed(value) => Some(value),
            Outcome::Denied { .. } => None,
        }
    }

    pub fn redirect_target(&self) -> Option<&str> {
        match self {
            Outcome::Allowed(_) => None,
            Outcome::Denied { redirect_target } => redirect_target.as_deref(),
        }
    }
}

/// Fixed-window rate limiter over a shared [`CounterStore`].
///
/// A request with no live counter starts one at 1. A request under the
/// limit writes `count + 1` back with the expiry reset to a full window
/// from now. A request at or over the limit is denied and leaves both the
/// value and the expiry untouched.
///
/// The read and the write are separate store calls, so concurrent requests
/// for the same key can under-count.
pub struct RateLimiter<S> {
    store: Arc<S>,
}

impl<S> Clone for RateLimiter<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: CounterStore> RateLimiter<S> {
    /// Create a rate limiter counting in `store`.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Get the underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Count a request against `policy` and decide whether it may proceed.
    pub async fn check<R: RequestIdentity + ?Sized>(
        &self,
        request: &R,
        policy: &Policy,
    ) -> Result<Decision> {
        let key = policy.mode().derive_key(request, policy.scope())?;

        trace!(
            key = %key,
            mode = %policy.mode(),
            limit = policy.max_requests(),
            "Checking rate limit"
        );

        let decision = match self.read(&key).await? {
            None => {
                self.write(&key, 1, policy).await?;
                debug!(key = %key, window = ?policy.window(), "Started new counter");
                Decision::Allowed { count: 1 }
            }
            Some(count) if count >= policy.max_requests() => {
                debug!(
                    key = %key,
                    count = count,
                    limit = policy.max_requests(),
                    "Rate limit exceeded"
                );
                Decision::Denied {
                    count,
                    redirect_target: policy.redirect_target().map(str::to_owned),
                }
            }
            Some(count) => {
                let count = count + 1;
                self.write(&key, count, policy).await?;
                Decision::Allowed { count }
            }
        };

        Ok(decision)
    }

    /// Run `operation` with `request` if the policy admits it.
    ///
    /// The quota is consumed before the operation starts and is not returned
    /// if the operation fails or is cancelled.
    pub async fn check_and_run<R, F, Fut, T>(
        &self,
        request: R,
        policy: &Policy,
        operation: F,
    ) -> Result<Outcome<T>>
    where
        R: RequestIdentity,
        F: FnOnce(R) -> Fut,
        Fut: Future<Output = T>,
    {
        let decision = self.check(&request, policy).await?;
        match decision {
            Decision::Allowed { .. } => Ok(Outcome::Allowed(operation(request).await)),
            Decision::Denied {
                redirect_target, ..
            } => Ok(Outcome::Denied { redirect_target }),
        }
    }

    /// Get the live counter value for the request's bucket without counting.
    pub async fn counter_value<R: RequestIdentity + ?Sized>(
        &self,
        request: &R,
        policy: &Policy,
    ) -> Result<Option<u64>> {
        let key = policy.mode().derive_key(request, policy.scope())?;
        self.read(&key).await
    }

    async fn read(&self, key: &BucketKey) -> Result<Option<u64>> {
        self.store.get(key).await.map_err(|e| {
            warn!(key = %key, error = %e, "Failed to read counter");
            e
        })
    }

    async fn write(&self, key: &BucketKey, count: u64, policy: &Policy) -> Result<()> {
        self.store
            .set_with_ttl(key, count, policy.window())
            .await
            .map_err(|e| {
                warn!(key = %key, error = %e, "Failed to write counter");
                e
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TurnstileError;
    use crate::ratelimit::{ClientIdentity, KeyMode, MemoryStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    const WINDOW: Duration = Duration::from_secs(60);

    fn limiter() -> RateLimiter<MemoryStore> {
        RateLimiter::new(Arc::new(MemoryStore::new()))
    }

    fn policy(max_requests: u64) -> Policy {
        Policy::new(max_requests, WINDOW).unwrap()
    }

    fn client(address: &str) -> ClientIdentity {
        ClientIdentity::new(address)
    }

    async fn stored(limiter: &RateLimiter<MemoryStore>, key: &str) -> Option<u64> {
        limiter.store().get(&BucketKey::new(key)).await.unwrap()
    }

    /// A store whose backend is unreachable.
    struct UnreachableStore;

    #[async_trait]
    impl CounterStore for UnreachableStore {
        async fn get(&self, _key: &BucketKey) -> Result<Option<u64>> {
            Err(TurnstileError::StoreUnavailable("connection refused".to_string()))
        }

        async fn set_with_ttl(&self, _key: &BucketKey, _value: u64, _ttl: Duration) -> Result<()> {
            Err(TurnstileError::StoreUnavailable("connection refused".to_string()))
        }
    }

    /// A store that reads fine but rejects writes.
    struct ReadOnlyStore(MemoryStore);

    #[async_trait]
    impl CounterStore for ReadOnlyStore {
        async fn get(&self, key: &BucketKey) -> Result<Option<u64>> {
            self.0.get(key).await
        }

        async fn set_with_ttl(&self, _key: &BucketKey, _value: u64, _ttl: Duration) -> Result<()> {
            Err(TurnstileError::StoreUnavailable("read-only replica".to_string()))
        }
    }

    #[tokio::test]
    async fn test_first_request_starts_counter() {
        let limiter = limiter();

        let decision = limiter.check(&client("10.0.0.1"), &policy(3)).await.unwrap();

        assert_eq!(decision, Decision::Allowed { count: 1 });
        assert_eq!(stored(&limiter, "10.0.0.1").await, Some(1));
    }

    #[tokio::test]
    async fn test_exactly_limit_requests_allowed() {
        for max in [1, 2, 5, 10] {
            let limiter = limiter();
            let policy = policy(max);
            let request = client("10.0.0.1");

            for i in 1..=max {
                let decision = limiter.check(&request, &policy).await.unwrap();
                assert_eq!(decision, Decision::Allowed { count: i }, "request {} of {}", i, max);
            }

            let decision = limiter.check(&request, &policy).await.unwrap();
            assert!(!decision.is_allowed(), "request {} should be denied", max + 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_request_leaves_counter_untouched() {
        let limiter = limiter();
        let policy = policy(2);
        let request = client("10.0.0.1");
        let key = BucketKey::new("10.0.0.1");

        limiter.check(&request, &policy).await.unwrap();
        limiter.check(&request, &policy).await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;

        let decision = limiter.check(&request, &policy).await.unwrap();

        assert_eq!(
            decision,
            Decision::Denied {
                count: 2,
                redirect_target: None
            }
        );
        assert_eq!(stored(&limiter, "10.0.0.1").await, Some(2));
        assert_eq!(
            limiter.store().time_to_live(&key),
            Some(Duration::from_secs(40))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_allowed_request_refreshes_window() {
        let limiter = limiter();
        let policy = policy(3);
        let request = client("10.0.0.1");
        let key = BucketKey::new("10.0.0.1");

        limiter.check(&request, &policy).await.unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;
        limiter.check(&request, &policy).await.unwrap();

        assert_eq!(limiter.store().time_to_live(&key), Some(WINDOW));

        // Past the first request's original window, the counter survives.
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(stored(&limiter, "10.0.0.1").await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_scenario() {
        let limiter = limiter();
        let policy = policy(3);
        let request = client("A");

        for _ in 0..3 {
            let outcome = limiter
                .check_and_run(&request, &policy, |_| async { "ok" })
                .await
                .unwrap();
            assert_eq!(outcome, Outcome::Allowed("ok"));
        }
        assert_eq!(stored(&limiter, "A").await, Some(3));

        let outcome = limiter
            .check_and_run(&request, &policy, |_| async { "ok" })
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Denied { redirect_target: None });

        tokio::time::advance(WINDOW).await;

        let outcome = limiter
            .check_and_run(&request, &policy, |_| async { "ok" })
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Allowed("ok"));
        assert_eq!(stored(&limiter, "A").await, Some(1));
    }

    #[tokio::test]
    async fn test_denied_carries_redirect_target() {
        let limiter = limiter();
        let redirecting = policy(1).with_redirect("/blocked");
        let request = client("10.0.0.1");

        limiter.check(&request, &redirecting).await.unwrap();
        let outcome = limiter
            .check_and_run(&request, &redirecting, |_| async {})
            .await
            .unwrap();

        assert_eq!(
            outcome,
            Outcome::Denied {
                redirect_target: Some("/blocked".to_string())
            }
        );
        assert_eq!(outcome.redirect_target(), Some("/blocked"));
    }

    #[tokio::test]
    async fn test_denied_does_not_run_operation() {
        let limiter = limiter();
        let policy = policy(1);
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            limiter
                .check_and_run(client("10.0.0.1"), &policy, |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_operation_receives_request_and_result_is_returned() {
        let limiter = limiter();
        let request = client("10.0.0.1").with_principal("alice");

        let outcome = limiter
            .check_and_run(request.clone(), &policy(5), |req| async move {
                format!("hello {}", req.principal.unwrap_or_default())
            })
            .await
            .unwrap();

        assert_eq!(outcome.into_allowed(), Some("hello alice".to_string()));
    }

    #[tokio::test]
    async fn test_failed_operation_still_consumes_quota() {
        let limiter = limiter();
        let policy = policy(1);

        let outcome = limiter
            .check_and_run(client("10.0.0.1"), &policy, |_| async {
                Err::<(), &str>("backend exploded")
            })
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Allowed(Err("backend exploded")));

        let outcome = limiter
            .check_and_run(client("10.0.0.1"), &policy, |_| async { Ok::<(), &str>(()) })
            .await
            .unwrap();
        assert!(!outcome.is_allowed());
    }

    #[tokio::test]
    async fn test_addresses_have_separate_counters() {
        let limiter = limiter();
        let policy = policy(1);
        let alice_at_a = client("10.0.0.1").with_principal("alice");
        let alice_at_b = client("10.0.0.2").with_principal("alice");

        assert!(limiter.check(&alice_at_a, &policy).await.unwrap().is_allowed());
        assert!(limiter.check(&alice_at_b, &policy).await.unwrap().is_allowed());
        assert!(!limiter.check(&alice_at_a, &policy).await.unwrap().is_allowed());

        assert_eq!(stored(&limiter, "10.0.0.1").await, Some(1));
        assert_eq!(stored(&limiter, "10.0.0.2").await, Some(1));
    }

    #[tokio::test]
    async fn test_principal_mode_shares_counter_across_addresses() {
        let limiter = limiter();
        let policy = policy(2).with_mode(KeyMode::ByPrincipal);

        limiter
            .check(&client("10.0.0.1").with_principal("alice"), &policy)
            .await
            .unwrap();
        limiter
            .check(&client("10.0.0.2").with_principal("alice"), &policy)
            .await
            .unwrap();
        let decision = limiter
            .check(&client("10.0.0.3").with_principal("alice"), &policy)
            .await
            .unwrap();

        assert!(!decision.is_allowed());
        assert_eq!(stored(&limiter, "alice").await, Some(2));
    }

    #[tokio::test]
    async fn test_principal_mode_without_principal_is_an_error() {
        let limiter = limiter();
        let policy = policy(5).with_mode(KeyMode::ByPrincipal);
        let calls = AtomicUsize::new(0);

        let err = assert_err!(
            limiter
                .check_and_run(client("10.0.0.1"), &policy, |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                })
                .await
        );

        assert!(matches!(err, TurnstileError::MissingPrincipal));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(limiter.store().is_empty());
    }

    #[tokio::test]
    async fn test_scoped_policies_do_not_share_counters() {
        let limiter = limiter();
        let login = policy(1).with_scope("login");
        let search = policy(1).with_scope("search");
        let request = client("10.0.0.1");

        assert!(limiter.check(&request, &login).await.unwrap().is_allowed());
        assert!(limiter.check(&request, &search).await.unwrap().is_allowed());
        assert!(!limiter.check(&request, &login).await.unwrap().is_allowed());

        assert_eq!(
            limiter
                .store()
                .get(&BucketKey::scoped("login", "10.0.0.1"))
                .await
                .unwrap(),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_store_failure_is_propagated() {
        let limiter = RateLimiter::new(Arc::new(UnreachableStore));
        let calls = AtomicUsize::new(0);

        let err = assert_err!(
            limiter
                .check_and_run(client("10.0.0.1"), &policy(5), |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                })
                .await
        );

        assert!(matches!(err, TurnstileError::StoreUnavailable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_write_failure_is_propagated() {
        let limiter = RateLimiter::new(Arc::new(ReadOnlyStore(MemoryStore::new())));

        let err = assert_err!(limiter.check(&client("10.0.0.1"), &policy(5)).await);
        assert!(matches!(err, TurnstileError::StoreUnavailable(ref m) if m == "read-only replica"));
    }

    #[tokio::test]
    async fn test_deny_path_never_writes() {
        let store = MemoryStore::new();
        store
            .set_with_ttl(&BucketKey::new("10.0.0.1"), 5, WINDOW)
            .await
            .unwrap();
        let limiter = RateLimiter::new(Arc::new(ReadOnlyStore(store)));

        let decision = assert_ok!(limiter.check(&client("10.0.0.1"), &policy(5)).await);
        assert_eq!(decision.count(), 5);
        assert!(!decision.is_allowed());
    }

    #[tokio::test]
    async fn test_huge_window_counts_without_panicking() {
        let set = crate::ratelimit::PolicySet::from_yaml(
            "login:\n  max_requests: 3\n  window_secs: 18446744073709551615\n",
        )
        .unwrap();
        let policy = set.get("login").unwrap();
        let limiter = limiter();

        let decision = assert_ok!(limiter.check(&client("A"), policy).await);
        assert_eq!(decision, Decision::Allowed { count: 1 });
        assert_eq!(stored(&limiter, "A").await, Some(1));
    }

    #[tokio::test]
    async fn test_counter_value_does_not_count() {
        let limiter = limiter();
        let policy = policy(3);
        let request = client("10.0.0.1");

        assert_eq!(limiter.counter_value(&request, &policy).await.unwrap(), None);
        limiter.check(&request, &policy).await.unwrap();
        assert_eq!(limiter.counter_value(&request, &policy).await.unwrap(), Some(1));
        assert_eq!(limiter.counter_value(&request, &policy).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_concurrent_keys_are_independent() {
        let limiter = limiter();
        let policy = policy(2);

        let checks = (0..20).map(|i| {
            let limiter = limiter.clone();
            let policy = policy.clone();
            async move {
                limiter
                    .check(&client(&format!("10.0.0.{}", i)), &policy)
                    .await
                    .unwrap()
            }
        });
        let decisions = futures::future::join_all(checks).await;

        assert!(decisions.iter().all(|d| *d == Decision::Allowed { count: 1 }));
        assert_eq!(limiter.store().len(), 20);
    }
}
