//! TTL lock records guarding per-document critical sections.
//!
//! A lock is active while its record's `ttl` lies in the future. Waiters sleep
//! for the remaining time plus random jitter and try again. Holders release by
//! setting `ttl = now`, which [`LockGuard`] does on every exit path. A holder
//! that outlived its ttl leaves a successor's record alone.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;

use super::kv::{now_millis, KeyValueStore, LockMeta};
use super::StorageError;

/// Lock timing.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How long an acquired lock stays valid (default: 5s)
    pub ttl: Duration,
    /// Upper bound (exclusive) of the random retry jitter (default: 1s)
    pub max_jitter: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            max_jitter: Duration::from_millis(1000),
        }
    }
}

impl LockConfig {
    /// Short timings so contention tests finish quickly.
    pub fn for_testing() -> Self {
        Self {
            ttl: Duration::from_millis(200),
            max_jitter: Duration::from_millis(20),
        }
    }
}

/// Lock manager over a [`KeyValueStore`]'s metadata records.
pub struct DocumentLock {
    store: Arc<dyn KeyValueStore>,
    config: LockConfig,
    /// Serializes read-then-write of lock records within this process
    gate: Arc<Mutex<()>>,
}

impl DocumentLock {
    pub fn new(store: Arc<dyn KeyValueStore>, config: LockConfig) -> Self {
        Self {
            store,
            config,
            gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Run `critical_section` while holding the lock for `key`.
    ///
    /// The lock is released whether the section succeeds, fails, panics or
    /// is dropped before completion.
    pub async fn with_lock<F, Fut, T>(&self, key: &str, critical_section: F) -> Result<T, StorageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let guard = self.acquire(key).await?;
        let result = critical_section().await;
        if let Err(e) = guard.release().await {
            log::error!("Failed to release lock {key}: {e}");
        }
        result
    }

    /// Wait until the lock for `key` is free and take it.
    pub async fn acquire(&self, key: &str) -> Result<LockGuard, StorageError> {
        let ttl = self.config.ttl.as_millis() as u64;
        let mut attempts = 0u32;

        loop {
            let wait = {
                let _gate = self.gate.lock().await;
                let now = now_millis();
                match self.store.get_meta(key).await? {
                    Some(meta) if meta.is_active(now) => meta.remaining(now),
                    _ => {
                        let expires_at = now + ttl;
                        self.store.set_meta(key, LockMeta::expiring_at(expires_at)).await?;
                        if attempts > 0 {
                            log::debug!("Acquired lock {key} after {attempts} retries");
                        }
                        return Ok(LockGuard {
                            store: self.store.clone(),
                            gate: self.gate.clone(),
                            key: key.to_string(),
                            expires_at,
                            released: false,
                        });
                    }
                }
            };

            attempts += 1;
            let delay = Duration::from_millis(wait) + self.jitter();
            log::trace!("Lock {key} held, retrying in {delay:?}");
            tokio::time::sleep(delay).await;
        }
    }

    fn jitter(&self) -> Duration {
        let max = self.config.max_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max))
    }
}

/// A held lock. Dropping it without [`LockGuard::release`] releases in the
/// background on the current runtime.
pub struct LockGuard {
    store: Arc<dyn KeyValueStore>,
    gate: Arc<Mutex<()>>,
    key: String,
    /// Expiry this guard wrote; a different record belongs to another holder
    expires_at: u64,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Mark the lock expired, unless another holder has taken it since.
    pub async fn release(mut self) -> Result<(), StorageError> {
        self.released = true;
        release_owned(&*self.store, &self.gate, &self.key, self.expires_at).await?;
        Ok(())
    }
}

/// Expire `key` if its record is still the one written at acquisition.
/// Returns whether it was.
async fn release_owned(
    store: &dyn KeyValueStore,
    gate: &Mutex<()>,
    key: &str,
    expires_at: u64,
) -> Result<bool, StorageError> {
    let _gate = gate.lock().await;
    match store.get_meta(key).await? {
        Some(meta) if meta.ttl == expires_at => {
            store.set_meta(key, LockMeta::expiring_at(now_millis())).await?;
            Ok(true)
        }
        _ => {
            log::warn!("Lock {key} expired while held and was taken over, leaving it");
            Ok(false)
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let store = self.store.clone();
        let gate = self.gate.clone();
        let key = std::mem::take(&mut self.key);
        let expires_at = self.expires_at;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match release_owned(&*store, &gate, &key, expires_at).await {
                        Ok(true) => log::debug!("Released abandoned lock {key}"),
                        Ok(false) => {}
                        Err(e) => log::error!("Failed to release abandoned lock {key}: {e}"),
                    }
                });
            }
            Err(_) => {
                log::warn!("Lock {key} dropped outside a runtime, it expires at its ttl");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn lock_with(config: LockConfig) -> (Arc<MemoryStore>, Arc<DocumentLock>) {
        let store = Arc::new(MemoryStore::new());
        let lock = Arc::new(DocumentLock::new(store.clone(), config));
        (store, lock)
    }

    #[tokio::test]
    async fn test_uncontended_lock_released_after_success() {
        let (store, lock) = lock_with(LockConfig::for_testing());

        let value = lock.with_lock("doc", || async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);

        let meta = store.get_meta("doc").await.unwrap().unwrap();
        assert!(!meta.is_active(now_millis()));
    }

    #[tokio::test]
    async fn test_lock_released_after_error() {
        let (store, lock) = lock_with(LockConfig::for_testing());

        let result: Result<(), _> = lock
            .with_lock("doc", || async { Err(StorageError::Crdt("boom".into())) })
            .await;
        assert!(result.is_err());

        let meta = store.get_meta("doc").await.unwrap().unwrap();
        assert!(!meta.is_active(now_millis()));
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let (_store, lock) = lock_with(LockConfig::for_testing());
        let inside = Arc::new(AtomicUsize::new(0));
        let entered = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let lock = lock.clone();
            let inside = inside.clone();
            let entered = entered.clone();
            handles.push(tokio::spawn(async move {
                lock.with_lock("doc", || async {
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    entered.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(entered.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_waiter_enters_within_ttl_plus_jitter() {
        let config = LockConfig::for_testing();
        let bound = config.ttl + config.max_jitter + Duration::from_millis(150);
        let (store, lock) = lock_with(config);

        // A foreign holder that never releases
        store
            .set_meta("doc", LockMeta::expiring_at(now_millis() + 200))
            .await
            .unwrap();

        let start = Instant::now();
        lock.with_lock("doc", || async { Ok(()) }).await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(150), "entered too early: {waited:?}");
        assert!(waited < bound, "waited {waited:?}");
    }

    #[tokio::test]
    async fn test_unrelated_keys_do_not_block() {
        let (_store, lock) = lock_with(LockConfig {
            ttl: Duration::from_secs(10),
            max_jitter: Duration::ZERO,
        });

        let held = lock.acquire("a").await.unwrap();
        let start = Instant::now();
        lock.with_lock("b", || async { Ok(()) }).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        held.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_released_after_panic() {
        let (store, lock) = lock_with(LockConfig {
            ttl: Duration::from_secs(10),
            max_jitter: Duration::ZERO,
        });

        let panicking = lock.clone();
        let result = tokio::spawn(async move {
            panicking
                .with_lock("doc", || async {
                    if true {
                        panic!("critical section failed");
                    }
                    Ok(())
                })
                .await
        })
        .await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let meta = store.get_meta("doc").await.unwrap().unwrap();
        assert!(!meta.is_active(now_millis()));
    }

    #[tokio::test]
    async fn test_lock_released_when_future_dropped() {
        let (store, lock) = lock_with(LockConfig {
            ttl: Duration::from_secs(10),
            max_jitter: Duration::ZERO,
        });

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            lock.with_lock("doc", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
        )
        .await;
        assert!(cancelled.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let meta = store.get_meta("doc").await.unwrap().unwrap();
        assert!(!meta.is_active(now_millis()));

        let start = Instant::now();
        lock.with_lock("doc", || async { Ok(()) }).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_overrun_holder_leaves_successor_lock() {
        let (store, lock) = lock_with(LockConfig {
            ttl: Duration::from_millis(50),
            max_jitter: Duration::ZERO,
        });

        let first = lock.acquire("doc").await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let second = lock.acquire("doc").await.unwrap();
        let successor = store.get_meta("doc").await.unwrap().unwrap();

        first.release().await.unwrap();
        let meta = store.get_meta("doc").await.unwrap().unwrap();
        assert_eq!(meta, successor);
        assert!(meta.is_active(now_millis()));

        second.release().await.unwrap();
        let meta = store.get_meta("doc").await.unwrap().unwrap();
        assert!(!meta.is_active(now_millis()));
    }

    #[tokio::test]
    async fn test_dropped_overrun_holder_leaves_successor_lock() {
        let (store, lock) = lock_with(LockConfig {
            ttl: Duration::from_millis(50),
            max_jitter: Duration::ZERO,
        });

        let first = lock.acquire("doc").await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let second = lock.acquire("doc").await.unwrap();

        drop(first);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let meta = store.get_meta("doc").await.unwrap().unwrap();
        assert!(meta.is_active(now_millis()));
        second.release().await.unwrap();
    }

    #[test]
    fn test_default_config() {
        let config = LockConfig::default();
        assert_eq!(config.ttl, Duration::from_secs(5));
        assert_eq!(config.max_jitter, Duration::from_millis(1000));
    }
}
