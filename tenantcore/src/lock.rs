//! Cross-process mutual exclusion over a shared key-value store.
//!
//! A lock is a key that exists only while held. Acquiring sets the key to a
//! fresh token if and only if it is absent, with a TTL so a crashed holder
//! cannot wedge it forever. Releasing deletes the key only if it still holds
//! the caller's token; the compare and the delete happen atomically in the
//! store, so an expired-then-reacquired lock is never removed by its previous
//! holder.
//!
//! Keys are formatted as `{prefix}:lock:{key}`.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use nutype::nutype;
use tracing::{debug, error, warn};

use crate::errors::{BoxError, LockError, LockResult};

/// Pause between acquisition attempts when none is configured.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Lifetime of a held lock, in seconds. Always at least one second.
#[nutype(
    validate(greater_or_equal = 1),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize, Deserialize)
)]
pub struct LockTtl(u64);

impl LockTtl {
    /// TTL as a `Duration`.
    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.into_inner())
    }
}

/// Outcome of a compare-and-delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The key held the expected token and was removed.
    Released,
    /// The key held something else, or nothing. It was left untouched.
    Mismatch {
        /// Value found under the key, if any
        current: Option<String>,
    },
}

/// Atomic key-value primitives backing [`DistributedLock`].
#[async_trait]
pub trait LockStore: Send + Sync + 'static {
    /// Sets `key` to `value` with `ttl` only if the key is absent. Returns
    /// whether the key was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BoxError>;

    /// Deletes `key` only if it currently holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str)
        -> Result<ReleaseOutcome, BoxError>;
}

/// Proof of acquisition: the value stored under the lock key.
///
/// Tokens are the acquisition time in epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    fn issue() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_millis());
        Self(millis.to_string())
    }

    /// Rebuilds a token from its stored form.
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Stored form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Distributed lock client.
///
/// Cheap to clone; clones share the same store connection.
pub struct DistributedLock<S> {
    store: Arc<S>,
    prefix: Arc<str>,
    retry_interval: Duration,
}

impl<S> Clone for DistributedLock<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            prefix: Arc::clone(&self.prefix),
            retry_interval: self.retry_interval,
        }
    }
}

impl<S> fmt::Debug for DistributedLock<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedLock")
            .field("prefix", &self.prefix)
            .field("retry_interval", &self.retry_interval)
            .finish_non_exhaustive()
    }
}

impl<S: LockStore> DistributedLock<S> {
    /// Creates a client over `store` with keys under `prefix`.
    pub fn new(store: S, prefix: impl Into<String>) -> Self {
        Self::from_shared(Arc::new(store), prefix)
    }

    /// Creates a client over an already shared store.
    pub fn from_shared(store: Arc<S>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: Arc::from(prefix.into()),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    /// Sets the pause between acquisition attempts. Zero falls back to the
    /// default.
    #[must_use]
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = if retry_interval.is_zero() {
            DEFAULT_RETRY_INTERVAL
        } else {
            retry_interval
        };
        self
    }

    /// Pause between acquisition attempts.
    pub const fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Fully formatted store key for `key`.
    pub fn format_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            format!("lock:{key}")
        } else {
            format!("{}:lock:{key}", self.prefix)
        }
    }

    /// Number of attempts allowed within `timeout`, or `None` to retry forever.
    fn attempt_limit(&self, timeout: Option<Duration>) -> Option<u64> {
        let timeout = timeout.filter(|t| !t.is_zero())?;
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let limit = (timeout.as_nanos() as f64 / self.retry_interval.as_nanos() as f64)
            .round()
            .max(1.0) as u64;
        Some(limit)
    }

    /// Acquires `key`, retrying every retry interval.
    ///
    /// With a `timeout`, gives up with [`LockError::Timeout`] after roughly
    /// `timeout / retry_interval` failed attempts. Without one (or with zero)
    /// it waits indefinitely.
    pub async fn acquire(
        &self,
        key: &str,
        ttl: LockTtl,
        timeout: Option<Duration>,
    ) -> LockResult<LockToken> {
        let full_key = self.format_key(key);
        let limit = self.attempt_limit(timeout);
        let started = Instant::now();
        let mut failed_attempts: u64 = 0;

        loop {
            let token = LockToken::issue();
            let acquired = self
                .store
                .set_if_absent(&full_key, token.as_str(), ttl.as_duration())
                .await
                .map_err(|source| LockError::Store {
                    action: "acquire",
                    key: full_key.clone(),
                    source,
                })?;

            if acquired {
                debug!(key = %full_key, %token, attempts = failed_attempts + 1, "lock acquired");
                return Ok(token);
            }

            tokio::time::sleep(self.retry_interval).await;
            failed_attempts += 1;

            if limit.is_some_and(|limit| failed_attempts >= limit) {
                let waited = started.elapsed();
                warn!(key = %full_key, ?waited, "gave up waiting for lock");
                return Err(LockError::Timeout {
                    key: full_key,
                    waited,
                });
            }
        }
    }

    /// Releases `key` if it still holds `token`.
    ///
    /// Returns `false` (and logs a warning) when the key holds another token or
    /// has expired; the key is left untouched in that case.
    pub async fn release(&self, key: &str, token: &LockToken) -> LockResult<bool> {
        let full_key = self.format_key(key);
        let outcome = self
            .store
            .compare_and_delete(&full_key, token.as_str())
            .await
            .map_err(|source| LockError::Store {
                action: "release",
                key: full_key.clone(),
                source,
            })?;

        match outcome {
            ReleaseOutcome::Released => {
                debug!(key = %full_key, %token, "lock released");
                Ok(true)
            }
            ReleaseOutcome::Mismatch { current } => {
                warn!(
                    key = %full_key,
                    expected = %token,
                    current = current.as_deref().unwrap_or("<none>"),
                    "lock token mismatch on release; key left untouched"
                );
                Ok(false)
            }
        }
    }

    /// Acquires `key` and returns a guard that releases it.
    pub async fn lock(
        &self,
        key: &str,
        ttl: LockTtl,
        timeout: Option<Duration>,
    ) -> LockResult<LockGuard<S>> {
        let token = self.acquire(key, ttl, timeout).await?;
        Ok(LockGuard {
            lock: self.clone(),
            key: key.to_string(),
            token: Some(token),
        })
    }
}

/// A held lock.
///
/// Call [`LockGuard::release`] to release and observe the outcome. A guard
/// dropped without releasing (a panic or an early return) releases in a
/// background task; if no runtime is available the key expires with its TTL.
#[must_use = "dropping the guard releases the lock"]
pub struct LockGuard<S: LockStore> {
    lock: DistributedLock<S>,
    key: String,
    token: Option<LockToken>,
}

impl<S: LockStore> fmt::Debug for LockGuard<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl<S: LockStore> LockGuard<S> {
    /// Unprefixed key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Token stored under the key.
    pub fn token(&self) -> Option<&LockToken> {
        self.token.as_ref()
    }

    /// Releases the lock. See [`DistributedLock::release`].
    pub async fn release(mut self) -> LockResult<bool> {
        match self.token.take() {
            Some(token) => self.lock.release(&self.key, &token).await,
            None => Ok(false),
        }
    }
}

impl<S: LockStore> Drop for LockGuard<S> {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let lock = self.lock.clone();
        let key = std::mem::take(&mut self.key);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = lock.release(&key, &token).await {
                        error!(key = %key, error = %err, "background lock release failed");
                    }
                });
            }
            Err(_) => {
                warn!(key = %key, "lock guard dropped outside a runtime; key will expire with its TTL");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use proptest::prelude::*;

    /// Map-backed store with no expiry; records attempts.
    #[derive(Default)]
    struct FakeStore {
        entries: Mutex<HashMap<String, String>>,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl LockStore for FakeStore {
        async fn set_if_absent(&self, key: &str, value: &str, _ttl: Duration) -> Result<bool, BoxError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let mut entries = self.entries.lock();
            if entries.contains_key(key) {
                return Ok(false);
            }
            entries.insert(key.to_string(), value.to_string());
            Ok(true)
        }

        async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<ReleaseOutcome, BoxError> {
            let mut entries = self.entries.lock();
            match entries.get(key) {
                Some(current) if current == expected => {
                    entries.remove(key);
                    Ok(ReleaseOutcome::Released)
                }
                current => Ok(ReleaseOutcome::Mismatch {
                    current: current.cloned(),
                }),
            }
        }
    }

    fn ttl(seconds: u64) -> LockTtl {
        LockTtl::try_new(seconds).unwrap()
    }

    #[test]
    fn keys_carry_prefix_and_namespace() {
        let lock = DistributedLock::new(FakeStore::default(), "crm");
        assert_eq!(lock.format_key("label:7"), "crm:lock:label:7");

        let bare = DistributedLock::new(FakeStore::default(), "");
        assert_eq!(bare.format_key("label:7"), "lock:label:7");
    }

    #[test]
    fn ttl_must_be_positive() {
        assert!(LockTtl::try_new(0).is_err());
        assert_eq!(ttl(300).as_duration(), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn acquire_then_release_frees_the_key() {
        let lock = DistributedLock::new(FakeStore::default(), "app");

        let token = lock.acquire("job", ttl(10), None).await.unwrap();
        assert!(lock.release("job", &token).await.unwrap());

        // The key is free again.
        let again = lock.acquire("job", ttl(10), Some(Duration::from_millis(10))).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn release_with_wrong_token_leaves_the_key() {
        let lock = DistributedLock::new(FakeStore::default(), "app");
        let _held = lock.acquire("job", ttl(10), None).await.unwrap();

        let stale = LockToken::from_stored("1");
        assert!(!lock.release("job", &stale).await.unwrap());
        assert!(lock.store().entries.lock().contains_key("app:lock:job"));
    }

    #[tokio::test(start_paused = true)]
    async fn contended_acquire_times_out_after_the_attempt_budget() {
        // Given: a held key and a 1s timeout with 100ms retries
        let lock = DistributedLock::new(FakeStore::default(), "app");
        lock.acquire("job", ttl(10), None).await.unwrap();
        lock.store().attempts.store(0, Ordering::SeqCst);

        // When: a second caller tries to take it
        let result = lock
            .acquire("job", ttl(10), Some(Duration::from_secs(1)))
            .await;

        // Then: it gives up after ten failed attempts
        assert!(matches!(result, Err(LockError::Timeout { ref key, .. }) if key == "app:lock:job"));
        assert_eq!(lock.store().attempts.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_waits_until_the_holder_releases() {
        let lock = DistributedLock::new(FakeStore::default(), "app")
            .with_retry_interval(Duration::from_millis(50));
        let held = lock.acquire("job", ttl(10), None).await.unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire("job", ttl(10), Some(Duration::ZERO)).await })
        };

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!waiter.is_finished());

        lock.release("job", &held).await.unwrap();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn dropped_guard_releases_in_background() {
        let lock = DistributedLock::new(FakeStore::default(), "app");
        {
            let _guard = lock.lock("job", ttl(10), None).await.unwrap();
            assert!(lock.store().entries.lock().contains_key("app:lock:job"));
        }

        for _ in 0..50 {
            if lock.store().entries.lock().is_empty() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("guard drop did not release the key");
    }

    #[tokio::test]
    async fn explicit_guard_release_reports_outcome() {
        let lock = DistributedLock::new(FakeStore::default(), "app");
        let guard = lock.lock("job", ttl(10), None).await.unwrap();
        assert_eq!(guard.key(), "job");
        assert!(guard.release().await.unwrap());
    }

    proptest! {
        #[test]
        fn attempt_limit_rounds_timeout_over_interval(timeout_ms in 1u64..60_000, retry_ms in 1u64..1_000) {
            let lock = DistributedLock::new(FakeStore::default(), "p")
                .with_retry_interval(Duration::from_millis(retry_ms));
            let limit = lock.attempt_limit(Some(Duration::from_millis(timeout_ms))).unwrap();

            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let expected = ((timeout_ms as f64 / retry_ms as f64).round() as u64).max(1);
            prop_assert_eq!(limit, expected);
        }
    }
}
