//! Read-through / write-through cache for hostname resolution
//!
//! Only domain lookups are cached. Certificate operations go straight to the
//! wrapped store.

use super::{Store, StoreError};
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use tracing::debug;

/// Default number of hostnames kept in memory
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

struct CacheState {
    lru: LruCache<String, String>,
    /// Bumped by every write; a read-through fill started under an older
    /// generation is dropped.
    generation: u64,
}

/// Cache statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub capacity: usize,
}

/// State shared with write tasks, which outlive a cancelled caller
struct Shared {
    inner: Arc<dyn Store>,
    state: Mutex<CacheState>,
    write_lock: TokioMutex<()>,
}

impl Shared {
    /// Apply a committed write to the cache. `None` evicts.
    fn apply(&self, hostname: &str, customer_id: Option<&str>) {
        let mut state = self.state.lock();
        state.generation += 1;
        match customer_id {
            Some(id) if !id.is_empty() => {
                state.lru.put(hostname.to_string(), id.to_string());
            }
            _ => {
                state.lru.pop(hostname);
            }
        }
    }
}

/// Store decorator holding positive hostname lookups in a bounded LRU.
///
/// Unmapped hostnames are never cached, so a mapping created behind the
/// cache's back becomes visible on the next lookup.
///
/// Each write runs to completion on its own task: dropping the caller's
/// future never leaves the store committed with the cache unchanged.
pub struct CachedStore {
    shared: Arc<Shared>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CachedStore {
    pub fn new(inner: Arc<dyn Store>, capacity: NonZeroUsize) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner,
                state: Mutex::new(CacheState {
                    lru: LruCache::new(capacity),
                    generation: 0,
                }),
                write_lock: TokioMutex::new(()),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.shared.state.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: state.lru.len(),
            capacity: state.lru.cap().get(),
        }
    }
}

#[async_trait]
impl Store for CachedStore {
    async fn get_domain(&self, hostname: &str) -> Result<Option<String>, StoreError> {
        let generation = {
            let mut state = self.shared.state.lock();
            if let Some(customer_id) = state.lru.get(hostname) {
                let customer_id = customer_id.clone();
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(customer_id));
            }
            state.generation
        };

        self.misses.fetch_add(1, Ordering::Relaxed);
        let resolved = self.shared.inner.get_domain(hostname).await?;

        if let Some(customer_id) = &resolved {
            let mut state = self.shared.state.lock();
            if state.generation == generation {
                state.lru.put(hostname.to_string(), customer_id.clone());
            } else {
                debug!("Skipping cache fill for {} after concurrent write", hostname);
            }
        }

        Ok(resolved)
    }

    async fn set_domain(&self, hostname: &str, customer_id: &str) -> Result<(), StoreError> {
        let shared = self.shared.clone();
        let hostname = hostname.to_string();
        let customer_id = customer_id.to_string();

        tokio::spawn(async move {
            let _guard = shared.write_lock.lock().await;
            shared.inner.set_domain(&hostname, &customer_id).await?;
            shared.apply(&hostname, Some(&customer_id));
            Ok::<_, StoreError>(())
        })
        .await?
    }

    async fn delete_domain(&self, hostname: &str) -> Result<(), StoreError> {
        let shared = self.shared.clone();
        let hostname = hostname.to_string();

        tokio::spawn(async move {
            let _guard = shared.write_lock.lock().await;
            let result = shared.inner.delete_domain(&hostname).await;
            // Evict even when the store failed
            shared.apply(&hostname, None);
            result
        })
        .await?
    }

    async fn list_domains(&self) -> Result<HashMap<String, String>, StoreError> {
        self.shared.inner.list_domains().await
    }

    async fn get_cert(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.shared.inner.get_cert(key).await
    }

    async fn set_cert(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        self.shared.inner.set_cert(key, data).await
    }

    async fn delete_cert(&self, key: &str) -> Result<(), StoreError> {
        self.shared.inner.delete_cert(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SqliteStore};
    use rand::Rng;
    use std::future::ready;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Notify;

    /// Counts domain reads, can be switched into a failing mode, and can park
    /// reads after they have fetched their value
    #[derive(Default)]
    struct InstrumentedStore {
        inner: MemoryStore,
        domain_reads: AtomicU64,
        failing: AtomicBool,
        gated: AtomicBool,
        parked: Notify,
        release: Notify,
    }

    impl InstrumentedStore {
        fn reads(&self) -> u64 {
            self.domain_reads.load(Ordering::SeqCst)
        }

        fn fail(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("instrumented failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Store for InstrumentedStore {
        async fn get_domain(&self, hostname: &str) -> Result<Option<String>, StoreError> {
            self.domain_reads.fetch_add(1, Ordering::SeqCst);
            self.check()?;
            let value = self.inner.get_domain(hostname).await?;
            if self.gated.load(Ordering::SeqCst) {
                self.parked.notify_one();
                self.release.notified().await;
            }
            Ok(value)
        }

        async fn set_domain(&self, hostname: &str, customer_id: &str) -> Result<(), StoreError> {
            self.check()?;
            self.inner.set_domain(hostname, customer_id).await
        }

        async fn delete_domain(&self, hostname: &str) -> Result<(), StoreError> {
            self.check()?;
            self.inner.delete_domain(hostname).await
        }

        async fn list_domains(&self) -> Result<HashMap<String, String>, StoreError> {
            self.check()?;
            self.inner.list_domains().await
        }

        async fn get_cert(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get_cert(key).await
        }

        async fn set_cert(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
            self.inner.set_cert(key, data).await
        }

        async fn delete_cert(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete_cert(key).await
        }
    }

    fn cached(capacity: usize) -> (Arc<InstrumentedStore>, CachedStore) {
        let backend = Arc::new(InstrumentedStore::default());
        let cache = CachedStore::new(
            backend.clone() as Arc<dyn Store>,
            NonZeroUsize::new(capacity).unwrap(),
        );
        (backend, cache)
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let (_backend, cache) = cached(10);

        cache.set_domain("a.example.com", "cust-42").await.unwrap();
        assert_eq!(
            cache.get_domain("a.example.com").await.unwrap(),
            Some("cust-42".to_string())
        );

        cache.delete_domain("a.example.com").await.unwrap();
        assert_eq!(cache.get_domain("a.example.com").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_through_serves_without_store_read() {
        let (backend, cache) = cached(10);

        cache.set_domain("a.example.com", "cust-42").await.unwrap();
        assert_eq!(
            cache.get_domain("a.example.com").await.unwrap(),
            Some("cust-42".to_string())
        );
        assert_eq!(backend.reads(), 0);
    }

    #[tokio::test]
    async fn test_hit_never_touches_store() {
        let (backend, cache) = cached(10);
        backend.inner.set_domain("a.example.com", "cust-42").await.unwrap();

        cache.get_domain("a.example.com").await.unwrap();
        assert_eq!(backend.reads(), 1);

        // Even a failing store is not consulted on a hit
        backend.fail(true);
        for _ in 0..5 {
            assert_eq!(
                cache.get_domain("a.example.com").await.unwrap(),
                Some("cust-42".to_string())
            );
        }
        assert_eq!(backend.reads(), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 5);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_unmapped_result_is_not_cached() {
        let (backend, cache) = cached(10);

        assert_eq!(cache.get_domain("new.example.com").await.unwrap(), None);
        assert_eq!(cache.get_domain("new.example.com").await.unwrap(), None);
        assert_eq!(backend.reads(), 2);

        // Mapping created directly in the store is visible on the next lookup
        backend.inner.set_domain("new.example.com", "cust-7").await.unwrap();
        assert_eq!(
            cache.get_domain("new.example.com").await.unwrap(),
            Some("cust-7".to_string())
        );
    }

    #[tokio::test]
    async fn test_failed_set_is_not_cached() {
        let (backend, cache) = cached(10);

        backend.fail(true);
        assert!(cache.set_domain("a.example.com", "cust-42").await.is_err());
        backend.fail(false);

        assert_eq!(cache.get_domain("a.example.com").await.unwrap(), None);
        assert_eq!(backend.reads(), 1);
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_lookup_error_propagates() {
        let (backend, cache) = cached(10);

        backend.fail(true);
        assert!(matches!(
            cache.get_domain("a.example.com").await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_delete_still_evicts() {
        let (backend, cache) = cached(10);
        cache.set_domain("a.example.com", "cust-42").await.unwrap();

        backend.fail(true);
        assert!(cache.delete_domain("a.example.com").await.is_err());
        backend.fail(false);

        // Entry was evicted, so the store answers (it still holds the mapping)
        assert_eq!(
            cache.get_domain("a.example.com").await.unwrap(),
            Some("cust-42".to_string())
        );
        assert_eq!(backend.reads(), 1);
    }

    #[tokio::test]
    async fn test_eviction_falls_back_to_store() {
        let (backend, cache) = cached(2);

        cache.set_domain("a.example.com", "1").await.unwrap();
        cache.set_domain("b.example.com", "2").await.unwrap();
        cache.set_domain("c.example.com", "3").await.unwrap();
        assert_eq!(cache.stats().entries, 2);

        assert_eq!(
            cache.get_domain("a.example.com").await.unwrap(),
            Some("1".to_string())
        );
        assert_eq!(backend.reads(), 1);
    }

    #[tokio::test]
    async fn test_list_served_from_store() {
        let (backend, cache) = cached(1);

        cache.set_domain("a.example.com", "1").await.unwrap();
        cache.set_domain("b.example.com", "2").await.unwrap();
        cache.set_domain("c.example.com", "3").await.unwrap();
        cache.delete_domain("b.example.com").await.unwrap();
        backend.inner.set_domain("d.example.com", "4").await.unwrap();

        let domains = cache.list_domains().await.unwrap();
        assert_eq!(domains.len(), 3);
        assert!(domains.contains_key("a.example.com"));
        assert!(domains.contains_key("c.example.com"));
        assert!(domains.contains_key("d.example.com"));
    }

    #[tokio::test]
    async fn test_certificates_pass_through() {
        let (backend, cache) = cached(10);

        cache.set_cert("k1", b"bundle").await.unwrap();
        assert_eq!(
            backend.inner.get_cert("k1").await.unwrap(),
            Some(b"bundle".to_vec())
        );
        cache.delete_cert("k1").await.unwrap();
        assert_eq!(cache.get_cert("k1").await.unwrap(), None);
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_readers_and_writers_converge() {
        let (_backend, cache) = cached(16);
        let cache = Arc::new(cache);

        let mut tasks = Vec::new();
        for worker in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..200 {
                    let host = format!("host-{}.example.com", i % 32);
                    if worker % 2 == 0 {
                        cache.set_domain(&host, &format!("cust-{}", i % 32)).await.unwrap();
                    } else {
                        cache.get_domain(&host).await.unwrap();
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Every cached value agrees with the store
        let snapshot = cache.list_domains().await.unwrap();
        for (host, customer_id) in snapshot {
            assert_eq!(cache.get_domain(&host).await.unwrap(), Some(customer_id));
        }
    }

    #[tokio::test]
    async fn test_fill_racing_delete_is_discarded() {
        let backend = Arc::new(InstrumentedStore::default());
        backend.inner.set_domain("a.example.com", "cust-42").await.unwrap();
        let cache = Arc::new(CachedStore::new(
            backend.clone() as Arc<dyn Store>,
            NonZeroUsize::new(10).unwrap(),
        ));

        backend.gated.store(true, Ordering::SeqCst);
        let reader = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_domain("a.example.com").await })
        };

        // The reader has fetched "cust-42" and is parked before filling
        backend.parked.notified().await;
        cache.delete_domain("a.example.com").await.unwrap();

        backend.gated.store(false, Ordering::SeqCst);
        backend.release.notify_one();
        assert_eq!(
            reader.await.unwrap().unwrap(),
            Some("cust-42".to_string())
        );

        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.get_domain("a.example.com").await.unwrap(), None);
        assert_eq!(backend.reads(), 2);
    }

    fn sqlite_cached() -> (Arc<SqliteStore>, CachedStore) {
        let backend = Arc::new(SqliteStore::open_in_memory().unwrap());
        let cache = CachedStore::new(
            backend.clone() as Arc<dyn Store>,
            NonZeroUsize::new(10).unwrap(),
        );
        (backend, cache)
    }

    /// Poll `write` once, then drop it
    async fn abandon<F: std::future::Future>(write: F) {
        tokio::select! {
            biased;
            _ = write => panic!("write finished on its first poll"),
            _ = ready(()) => {}
        }
    }

    #[tokio::test]
    async fn test_dropped_delete_still_evicts() {
        let (backend, cache) = sqlite_cached();
        cache.set_domain("a.example.com", "cust-42").await.unwrap();

        abandon(cache.delete_domain("a.example.com")).await;

        // Writes are serialized, so this one completes after the dropped one
        cache.set_domain("b.example.com", "cust-7").await.unwrap();

        assert_eq!(backend.get_domain("a.example.com").await.unwrap(), None);
        assert_eq!(cache.get_domain("a.example.com").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dropped_set_still_updates_cache() {
        let (backend, cache) = sqlite_cached();
        cache.set_domain("a.example.com", "cust-old").await.unwrap();

        abandon(cache.set_domain("a.example.com", "cust-new")).await;
        cache.set_domain("b.example.com", "cust-7").await.unwrap();

        assert_eq!(
            backend.get_domain("a.example.com").await.unwrap(),
            Some("cust-new".to_string())
        );
        assert_eq!(
            cache.get_domain("a.example.com").await.unwrap(),
            Some("cust-new".to_string())
        );
    }

    #[tokio::test]
    async fn test_matches_store_model() {
        // Random operations against a plain map of what the store holds
        let capacity = 8;
        let (backend, cache) = cached(capacity);
        let mut model: HashMap<String, String> = HashMap::new();
        let mut rng = rand::thread_rng();

        for step in 0..2_000 {
            let host = format!("host-{}.example.com", rng.gen_range(0..20));
            match rng.gen_range(0..4) {
                0 | 1 => {
                    assert_eq!(
                        cache.get_domain(&host).await.unwrap(),
                        model.get(&host).cloned(),
                        "step {}",
                        step
                    );
                }
                2 => {
                    let value = format!("cust-{}", step);
                    cache.set_domain(&host, &value).await.unwrap();
                    model.insert(host, value);
                }
                _ => {
                    cache.delete_domain(&host).await.unwrap();
                    model.remove(&host);
                }
            }
            assert!(cache.stats().entries <= capacity);
        }

        assert_eq!(backend.inner.list_domains().await.unwrap(), model);
    }
}
