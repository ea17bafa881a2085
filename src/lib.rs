// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

//! A reentrant, lease based distributed lock backed by Redis
//!
//! Redilock keeps a lock as a Redis hash mapping holder ids to a reentrancy
//! count, guarded by a key expiry. Acquisition is a single Lua script that
//! either creates the key, bumps the caller's count, or reports how long
//! someone else will keep holding it. While a lock is held a background task
//! extends the expiry every two thirds of the lease, so a crashed holder loses
//! the lock after at most one lease.
//!
//! # Examples
//!
//! ## Lock and unlock
//! [Redilock::lock] blocks, polling at the retry interval, until the lock is
//! acquired or the retry budget runs out.
//! ```rust,no_run
//! use redilock::{RedisConfig, RedisStore, Redilock};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), redilock::RedilockError> {
//!     let store = RedisStore::connect(&RedisConfig::default()).await?;
//!     let lock = Redilock::builder()
//!         .key("user:1")
//!         .store(store)
//!         .max_retry_count(10)
//!         .build()
//!         .await?;
//!
//!     lock.lock(Duration::from_secs(30), "client001").await?;
//!     // do synchronized work!
//!     lock.unlock().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Scoped
//! [Redilock::with] acquires, runs the closure and releases the caller's hold.
//! ```rust,no_run
//! use redilock::{RedisConfig, RedisStore, Redilock};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), redilock::RedilockError> {
//!     let store = RedisStore::connect(&RedisConfig::from_env()?).await?;
//!     let lock = Redilock::builder().key("user:1").store(store).build().await?;
//!
//!     let total = lock
//!         .with(Duration::from_secs(10), "client001", async || 40 + 2)
//!         .await?;
//!     assert_eq!(total, 42);
//!     Ok(())
//! }
//! ```

use std::{
    sync::atomic::{AtomicI64, Ordering},
    time::Duration,
};

pub mod error;
pub mod providers;
mod renewer;

use bon::bon;
use tokio::{
    sync::{Mutex, broadcast},
    time::sleep,
};
use tracing::debug;

use crate::{error::RenewalError, renewer::Renewer};

pub use error::RedilockError;
#[cfg(feature = "memory")]
pub use providers::memory::MemoryStore;
#[cfg(feature = "redis")]
pub use providers::redis::{RedisConfig, RedisStore};
pub use providers::{Acquisition, Release, Store};

/// Retry every second unless told otherwise.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(1000);

/// Retry forever.
pub const UNBOUNDED_RETRIES: i64 = -1;

const RENEWAL_ERROR_CAPACITY: usize = 16;

/// Handle on one lock key. Reusable across any number of lock/unlock cycles
/// and safe to share between tasks.
pub struct Redilock<S>
where
    S: Store,
{
    key: String,
    store: S,
    retry_interval: Duration,
    max_retry_count: AtomicI64,

    renewer: Mutex<Option<Renewer>>,
    renewal_errors: broadcast::Sender<RenewalError>,
}

#[bon]
impl<S> Redilock<S>
where
    S: Store,
{
    /// Create a handle, failing if the store does not answer a ping or the
    /// retry count is below -1.
    #[builder]
    pub async fn new(
        #[builder(into)] key: String,
        store: S,
        #[builder(default = UNBOUNDED_RETRIES)] max_retry_count: i64,
        #[builder(default = DEFAULT_RETRY_INTERVAL)] retry_interval: Duration,
    ) -> Result<Self, RedilockError> {
        validate_max_retry_count(max_retry_count)?;
        store.ping().await?;

        let (renewal_errors, _) = broadcast::channel(RENEWAL_ERROR_CAPACITY);
        Ok(Self {
            key,
            store,
            retry_interval,
            max_retry_count: AtomicI64::new(max_retry_count),
            renewer: Mutex::new(None),
            renewal_errors,
        })
    }
}

impl<S> Redilock<S>
where
    S: Store,
{
    /// Store key the lock lives under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Pause between acquisition attempts on a contended lock.
    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// Current retry budget, `-1` when unbounded.
    pub fn max_retry_count(&self) -> i64 {
        self.max_retry_count.load(Ordering::Relaxed)
    }

    /// Set how many times [Redilock::lock] retries a contended lock before
    /// giving up. `-1` retries forever, `0` fails on the first contention.
    pub fn set_max_retry_count(&self, max: i64) -> Result<(), RedilockError> {
        validate_max_retry_count(max)?;
        self.max_retry_count.store(max, Ordering::Relaxed);
        Ok(())
    }

    /// Whether a lease renewer is currently running for this handle.
    pub async fn is_renewing(&self) -> bool {
        self.renewer.lock().await.is_some()
    }

    /// Subscribe to failures of the background lease renewer.
    ///
    /// Renewal keeps going after a failure; a holder that cares whether it
    /// still owns the lock should watch this channel.
    pub fn renewal_errors(&self) -> broadcast::Receiver<RenewalError> {
        self.renewal_errors.subscribe()
    }

    /// Acquire the lock for `holder_id`, holding it for `lease` and renewing
    /// it in the background until released.
    ///
    /// Acquiring a lock already held by `holder_id` succeeds immediately and
    /// counts as one more reentrant hold. If another holder has it, the call
    /// sleeps for the retry interval and tries again, until the maximum retry
    /// count is reached. Store errors are returned right away.
    pub async fn lock(&self, lease: Duration, holder_id: &str) -> Result<(), RedilockError> {
        if lease < Duration::from_millis(1) {
            return Err(RedilockError::InvalidLeaseDuration(lease));
        }

        let mut attempt = Attempt::default();
        loop {
            match self.store.acquire(&self.key, lease, holder_id).await? {
                Acquisition::Acquired => {
                    debug!(key = %self.key, holder = holder_id, lease_ms = lease.as_millis(), "lock acquired");
                    self.start_renewer(lease, holder_id).await;
                    return Ok(());
                }
                Acquisition::Reentered => {
                    debug!(key = %self.key, holder = holder_id, "lock already held by this holder");
                    return Ok(());
                }
                Acquisition::HeldElsewhere { remaining } => {
                    attempt.retry(self.max_retry_count(), holder_id)?;
                    debug!(
                        key = %self.key,
                        holder = holder_id,
                        retry = attempt.retries,
                        remaining_ms = remaining.as_millis(),
                        "lock held elsewhere, retrying"
                    );
                    sleep(self.retry_interval).await;
                }
            }
        }
    }

    /// Stop renewing and delete the key, whoever holds it and however many
    /// reentrant holds are outstanding.
    ///
    /// Use [Redilock::release] to drop a single hold of a specific holder.
    pub async fn unlock(&self) -> Result<(), RedilockError> {
        let mut renewer = self.renewer.lock().await;
        if let Some(running) = renewer.take() {
            running.stop().await;
        }

        self.store.delete(&self.key).await?;
        debug!(key = %self.key, "lock deleted");
        Ok(())
    }

    /// Drop one reentrant hold of `holder_id`, deleting the key when it was
    /// the last one.
    ///
    /// Fails with [RedilockError::NotHolder] if `holder_id` does not hold the
    /// lock. Renewal continues as long as the key is still held, with an
    /// immediate extension so the restart cannot let the lease lapse. If the
    /// store fails, renewal stays stopped and the lease expires on its own.
    pub async fn release(&self, holder_id: &str) -> Result<Release, RedilockError> {
        let mut renewer = self.renewer.lock().await;
        let running = match renewer.take() {
            Some(running) => {
                let resume = (running.lease(), running.holder().to_string());
                running.stop().await;
                Some(resume)
            }
            None => None,
        };

        let outcome = self.store.release(&self.key, holder_id).await?;
        if outcome != Release::Released {
            if let Some((lease, holder)) = running {
                *renewer = Some(self.spawn_renewer(lease, holder, Duration::ZERO));
            }
        }

        match outcome {
            Release::NotHeld => Err(RedilockError::NotHolder {
                key: self.key.clone(),
                holder: holder_id.to_string(),
            }),
            released => {
                debug!(key = %self.key, holder = holder_id, outcome = ?released, "lock released");
                Ok(released)
            }
        }
    }

    /// Run `f` while holding the lock as `holder_id`.
    ///
    /// The hold is released with [Redilock::release] once `f` completes, so
    /// nested calls by the same holder unwind one level at a time.
    pub async fn with<R>(
        &self,
        lease: Duration,
        holder_id: &str,
        f: impl AsyncFnOnce() -> R,
    ) -> Result<R, RedilockError> {
        self.lock(lease, holder_id).await?;
        let result = f().await;
        self.release(holder_id).await?;
        Ok(result)
    }

    async fn start_renewer(&self, lease: Duration, holder_id: &str) {
        let mut renewer = self.renewer.lock().await;
        if let Some(previous) = renewer.take() {
            previous.stop().await;
        }
        *renewer = Some(self.spawn_renewer(lease, holder_id.to_string(), Renewer::interval(lease)));
    }

    fn spawn_renewer(&self, lease: Duration, holder: String, first_tick: Duration) -> Renewer {
        Renewer::start(
            self.store.clone(),
            self.key.clone(),
            lease,
            holder,
            first_tick,
            self.renewal_errors.clone(),
        )
    }
}

fn validate_max_retry_count(max: i64) -> Result<(), RedilockError> {
    if max < UNBOUNDED_RETRIES {
        return Err(RedilockError::InvalidMaxRetryCount(max));
    }
    Ok(())
}

/// Retry bookkeeping for one [Redilock::lock] call.
#[derive(Debug, Default)]
struct Attempt {
    retries: u64,
}

impl Attempt {
    /// Count one more retry, or fail if the budget is spent.
    fn retry(&mut self, max_retry_count: i64, holder_id: &str) -> Result<(), RedilockError> {
        if let Ok(limit) = u64::try_from(max_retry_count) {
            if self.retries >= limit {
                return Err(RedilockError::RetryLimitExceeded {
                    holder: holder_id.to_string(),
                    limit,
                });
            }
        }
        self.retries = self.retries.saturating_add(1);
        Ok(())
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use tokio::time::Instant;

    use super::*;
    use crate::providers::memory::MemoryStore;

    const KEY: &str = "user:1";
    const LEASE: Duration = Duration::from_secs(30);

    /// Timers fire on millisecond ticks, allow for the rounding.
    fn assert_about(actual: Duration, expected: Duration) {
        let slack = Duration::from_millis(5);
        assert!(
            actual + slack >= expected && actual <= expected + slack,
            "expected about {expected:?}, got {actual:?}"
        );
    }

    async fn handle(store: &MemoryStore) -> Redilock<MemoryStore> {
        Redilock::builder()
            .key(KEY)
            .store(store.clone())
            .build()
            .await
            .expect("should build handle")
    }

    #[test]
    fn attempt_budget() {
        let mut attempt = Attempt::default();
        attempt.retry(2, "a").unwrap();
        attempt.retry(2, "a").unwrap();
        let error = attempt.retry(2, "a").unwrap_err();
        assert!(matches!(error, RedilockError::RetryLimitExceeded { limit: 2, .. }));

        let mut attempt = Attempt::default();
        for _ in 0..1000 {
            attempt.retry(UNBOUNDED_RETRIES, "a").unwrap();
        }
        assert_eq!(attempt.retries, 1000);
    }

    #[tokio::test]
    async fn build_with_defaults() {
        let store = MemoryStore::new();
        let lock = handle(&store).await;

        assert_eq!(lock.key(), KEY);
        assert_eq!(lock.max_retry_count(), -1);
        assert_eq!(lock.retry_interval(), Duration::from_millis(1000));
        assert!(!lock.is_renewing().await);
    }

    #[tokio::test]
    async fn build_fails_when_store_unreachable() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        let result = Redilock::builder().key(KEY).store(store).build().await;
        assert!(matches!(result, Err(RedilockError::StoreError(_))));
    }

    #[tokio::test]
    async fn reject_retry_count_below_minus_one() {
        let store = MemoryStore::new();
        let result = Redilock::builder()
            .key(KEY)
            .store(store.clone())
            .max_retry_count(-2)
            .build()
            .await;
        assert!(matches!(result, Err(RedilockError::InvalidMaxRetryCount(-2))));

        let lock = handle(&store).await;
        assert!(lock.set_max_retry_count(-5).is_err());
        assert_eq!(lock.max_retry_count(), -1);
        lock.set_max_retry_count(0).unwrap();
        assert_eq!(lock.max_retry_count(), 0);
    }

    #[tokio::test]
    async fn reject_sub_millisecond_lease() {
        let store = MemoryStore::new();
        let lock = handle(&store).await;

        let error = lock.lock(Duration::from_micros(500), "a").await.unwrap_err();
        assert!(matches!(error, RedilockError::InvalidLeaseDuration(_)));
        assert_eq!(store.acquire_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn first_lock_registers_holder() {
        let store = MemoryStore::new();
        let lock = handle(&store).await;

        lock.lock(LEASE, "a").await.unwrap();

        assert_eq!(store.holders(KEY), Some(HashMap::from([("a".to_string(), 1)])));
        assert_eq!(store.ttl(KEY), Some(LEASE));
        assert!(lock.is_renewing().await);
    }

    #[tokio::test(start_paused = true)]
    async fn reentrant_lock_counts_holds() {
        let store = MemoryStore::new();
        let lock = handle(&store).await;

        lock.lock(LEASE, "a").await.unwrap();
        lock.lock(LEASE, "a").await.unwrap();

        let holders = store.holders(KEY).unwrap();
        assert_eq!(holders.len(), 1);
        assert_eq!(holders["a"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn contended_lock_fails_without_retries() {
        let store = MemoryStore::new();
        let a = handle(&store).await;
        let b = handle(&store).await;
        b.set_max_retry_count(0).unwrap();

        a.lock(LEASE, "a").await.unwrap();
        let start = Instant::now();
        let error = b.lock(LEASE, "b").await.unwrap_err();

        match error {
            RedilockError::RetryLimitExceeded { holder, limit } => {
                assert_eq!(holder, "b");
                assert_eq!(limit, 0);
            }
            _ => panic!("unexpected error: {}", error),
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(store.acquire_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn contended_lock_gives_up_after_budget() {
        let store = MemoryStore::new();
        let a = handle(&store).await;
        let b = handle(&store).await;
        b.set_max_retry_count(3).unwrap();

        a.lock(LEASE, "a").await.unwrap();
        let start = Instant::now();
        let error = b.lock(LEASE, "b").await.unwrap_err();

        assert!(matches!(error, RedilockError::RetryLimitExceeded { limit: 3, .. }));
        assert_about(start.elapsed(), Duration::from_secs(3));
        assert_eq!(store.acquire_calls(), 1 + 4);
    }

    #[tokio::test(start_paused = true)]
    async fn contended_lock_waits_for_unlock() {
        let store = MemoryStore::new();
        let a = handle(&store).await;
        let b = Arc::new(handle(&store).await);

        a.lock(LEASE, "a").await.unwrap();

        let start = Instant::now();
        let waiter = tokio::spawn({
            let b = Arc::clone(&b);
            async move {
                b.lock(LEASE, "b").await.unwrap();
                Instant::now()
            }
        });

        sleep(Duration::from_millis(3500)).await;
        assert!(!waiter.is_finished());
        a.unlock().await.unwrap();

        let acquired_at = waiter.await.unwrap();
        assert_about(acquired_at - start, Duration::from_secs(4));
        // a once, then b at 0s, 1s, 2s, 3s and 4s
        assert_eq!(store.acquire_calls(), 6);
        assert_eq!(store.holders(KEY), Some(HashMap::from([("b".to_string(), 1)])));
    }

    #[tokio::test(start_paused = true)]
    async fn lease_survives_under_renewal() {
        let store = MemoryStore::new();
        let lock = handle(&store).await;

        lock.lock(LEASE, "a").await.unwrap();

        // first extension at 20s, second at 40s
        sleep(Duration::from_secs(19)).await;
        assert_about(store.ttl(KEY).unwrap(), Duration::from_secs(11));
        sleep(Duration::from_secs(2)).await;
        assert_about(store.ttl(KEY).unwrap(), Duration::from_secs(29));

        sleep(Duration::from_secs(29)).await;
        assert_eq!(store.holders(KEY), Some(HashMap::from([("a".to_string(), 1)])));
        assert!(store.ttl(KEY).unwrap() > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn unlock_deletes_key_and_stops_renewal() {
        let store = MemoryStore::new();
        let lock = handle(&store).await;

        lock.lock(LEASE, "a").await.unwrap();
        lock.unlock().await.unwrap();

        assert_eq!(store.holders(KEY), None);
        assert!(!lock.is_renewing().await);

        lock.unlock().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unlock_ignores_holder_and_reentrancy() {
        let store = MemoryStore::new();
        let a = handle(&store).await;
        let b = handle(&store).await;

        a.lock(LEASE, "a").await.unwrap();
        a.lock(LEASE, "a").await.unwrap();
        b.unlock().await.unwrap();

        assert_eq!(store.holders(KEY), None);
    }

    #[tokio::test(start_paused = true)]
    async fn relock_after_unlock() {
        let store = MemoryStore::new();
        let lock = handle(&store).await;

        lock.lock(LEASE, "a").await.unwrap();
        lock.unlock().await.unwrap();
        lock.lock(LEASE, "b").await.unwrap();

        assert_eq!(store.holders(KEY), Some(HashMap::from([("b".to_string(), 1)])));
        assert!(lock.is_renewing().await);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_surfaces_store_errors() {
        let store = MemoryStore::new();
        let lock = handle(&store).await;
        store.set_unavailable(true);

        let error = lock.lock(LEASE, "a").await.unwrap_err();
        assert!(matches!(error, RedilockError::StoreError(_)));
        assert!(!lock.is_renewing().await);
    }

    #[tokio::test(start_paused = true)]
    async fn release_unwinds_reentrant_holds() {
        let store = MemoryStore::new();
        let lock = handle(&store).await;

        lock.lock(LEASE, "a").await.unwrap();
        lock.lock(LEASE, "a").await.unwrap();

        assert_eq!(
            lock.release("a").await.unwrap(),
            Release::Decremented { remaining: 1 }
        );
        assert!(lock.is_renewing().await);

        sleep(LEASE * 2).await;
        assert!(store.holders(KEY).is_some());

        assert_eq!(lock.release("a").await.unwrap(), Release::Released);
        assert!(!lock.is_renewing().await);
        assert_eq!(store.holders(KEY), None);
    }

    #[tokio::test(start_paused = true)]
    async fn release_by_non_holder_is_rejected() {
        let store = MemoryStore::new();
        let lock = handle(&store).await;

        lock.lock(LEASE, "a").await.unwrap();
        let error = lock.release("b").await.unwrap_err();

        assert!(matches!(error, RedilockError::NotHolder { ref holder, .. } if holder == "b"));
        assert!(lock.is_renewing().await);
        assert!(store.holders(KEY).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_failures_are_published() {
        let store = MemoryStore::new();
        let lock = handle(&store).await;
        let mut failures = lock.renewal_errors();

        lock.lock(LEASE, "a").await.unwrap();
        store.set_unavailable(true);

        let failure = failures.recv().await.unwrap();
        assert!(matches!(failure, RenewalError::Store { ref holder, .. } if holder == "a"));
        assert!(lock.is_renewing().await);
    }

    #[tokio::test(start_paused = true)]
    async fn with_releases_after_work() {
        let store = MemoryStore::new();
        let lock = handle(&store).await;

        let seen = lock
            .with(LEASE, "a", async || store.holders(KEY))
            .await
            .unwrap();

        assert_eq!(seen, Some(HashMap::from([("a".to_string(), 1)])));
        assert_eq!(store.holders(KEY), None);
    }

    #[tokio::test(start_paused = true)]
    async fn with_nests_for_same_holder() {
        let store = MemoryStore::new();
        let lock = handle(&store).await;

        let inner = lock
            .with(LEASE, "a", async || {
                lock.with(LEASE, "a", async || store.holders(KEY).unwrap()["a"])
                    .await
                    .unwrap()
            })
            .await
            .unwrap();

        assert_eq!(inner, 2);
        assert_eq!(store.holders(KEY), None);
    }

    #[test]
    fn attempt_budget_beyond_u32() {
        let mut attempt = Attempt {
            retries: u64::from(u32::MAX),
        };
        attempt.retry(5_000_000_000, "b").unwrap();
        assert_eq!(attempt.retries, u64::from(u32::MAX) + 1);

        let mut attempt = Attempt {
            retries: 5_000_000_000,
        };
        let error = attempt.retry(5_000_000_000, "b").unwrap_err();
        assert!(matches!(
            error,
            RedilockError::RetryLimitExceeded {
                limit: 5_000_000_000,
                ..
            }
        ));

        let mut attempt = Attempt { retries: u64::MAX };
        attempt.retry(UNBOUNDED_RETRIES, "b").unwrap();
        assert_eq!(attempt.retries, u64::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn release_midway_keeps_lease_alive() {
        let store = MemoryStore::new();
        let lock = handle(&store).await;

        lock.lock(LEASE, "a").await.unwrap();
        lock.lock(LEASE, "a").await.unwrap();

        sleep(Duration::from_secs(15)).await;
        assert_eq!(
            lock.release("a").await.unwrap(),
            Release::Decremented { remaining: 1 }
        );

        sleep(Duration::from_secs(16)).await;
        assert_eq!(store.holders(KEY), Some(HashMap::from([("a".to_string(), 1)])));

        sleep(LEASE * 3).await;
        assert!(store.holders(KEY).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_release_midway_keeps_lease_alive() {
        let store = MemoryStore::new();
        let lock = handle(&store).await;

        lock.lock(LEASE, "a").await.unwrap();

        sleep(Duration::from_secs(15)).await;
        lock.release("b").await.unwrap_err();

        sleep(Duration::from_secs(16)).await;
        assert_eq!(store.holders(KEY), Some(HashMap::from([("a".to_string(), 1)])));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_release_lets_lease_expire() {
        let store = MemoryStore::new();
        let lock = handle(&store).await;

        lock.lock(LEASE, "a").await.unwrap();
        store.set_unavailable(true);
        let error = lock.release("a").await.unwrap_err();
        assert!(matches!(error, RedilockError::StoreError(_)));
        assert!(!lock.is_renewing().await);

        store.set_unavailable(false);
        sleep(LEASE * 10).await;
        assert_eq!(store.holders(KEY), None);
    }

    #[tokio::test(start_paused = true)]
    async fn with_stops_renewing_when_release_fails() {
        let store = MemoryStore::new();
        let lock = handle(&store).await;

        let result = lock
            .with(LEASE, "a", async || store.set_unavailable(true))
            .await;
        assert!(matches!(result, Err(RedilockError::StoreError(_))));

        store.set_unavailable(false);
        sleep(Duration::from_secs(300)).await;
        assert_eq!(store.holders(KEY), None);
        assert!(!lock.is_renewing().await);
    }
}
