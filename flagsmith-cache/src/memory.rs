//! In-memory [`HttpCacheStore`]. Nothing survives a restart; useful for tests
//! and for hosts without a writable directory.
use crate::{CacheEntry, CacheError, CacheKey, CacheRecord, HttpCacheStore};
use async_trait::async_trait;
use lru::LruCache;
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
struct Inner {
    lru: LruCache<CacheKey, CacheEntry>,
    bytes_in_use: u64,
}

/// Least recently used entries are evicted once the byte budget is exceeded.
#[derive(Debug)]
pub struct InMemoryCacheStore {
    inner: Mutex<Inner>,
    max_size_bytes: u64,
}

impl InMemoryCacheStore {
    pub fn new(max_size_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                lru: LruCache::unbounded(),
                bytes_in_use: 0,
            }),
            max_size_bytes,
        }
    }
}

#[async_trait]
impl HttpCacheStore for InMemoryCacheStore {
    async fn find_all(&self, key: &CacheKey) -> Result<Vec<CacheRecord>, CacheError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| CacheError::Lock(e.to_string()))?;
        Ok(inner
            .lru
            .get(key)
            .map(|entry| entry.records.clone())
            .unwrap_or_default())
    }

    async fn store(&self, key: &CacheKey, record: CacheRecord) -> Result<(), CacheError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| CacheError::Lock(e.to_string()))?;
        let mut entry = inner.lru.pop(key).unwrap_or_default();
        inner.bytes_in_use = inner.bytes_in_use.saturating_sub(entry.byte_size());
        entry.upsert(record);
        inner.bytes_in_use += entry.byte_size();
        // most recently used, so the written key goes last unless it alone
        // is over budget
        inner.lru.push(key.clone(), entry);

        while inner.bytes_in_use > self.max_size_bytes {
            let Some((victim, removed)) = inner.lru.pop_lru() else {
                break;
            };
            let size = removed.byte_size();
            inner.bytes_in_use = inner.bytes_in_use.saturating_sub(size);
            debug!(key = %victim, size, "evicted cache entry");
        }
        Ok(())
    }

    async fn invalidate_all(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.lru.clear();
        inner.bytes_in_use = 0;
    }

    async fn size_bytes(&self) -> Result<u64, CacheError> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| CacheError::Lock(e.to_string()))?;
        Ok(inner.bytes_in_use)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::record;
    use crate::VaryKeys;

    #[tokio::test]
    async fn test_store_find_and_replace() {
        let store = InMemoryCacheStore::new(1024 * 1024);
        let first = record("http://h/flags/", "one", &[]);
        let key = first.key.clone();
        store.store(&key, first).await.unwrap();
        store
            .store(&key, record("http://h/flags/", "two", &[]))
            .await
            .unwrap();

        let found = store.find(&key, &VaryKeys::new()).await.unwrap().unwrap();
        assert_eq!(found.body, bytes::Bytes::from("two"));
        assert_eq!(store.find_all(&key).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_evicts_least_recently_used() {
        let a = record("http://h/a/", &"a".repeat(100), &[]);
        let b = record("http://h/b/", &"b".repeat(100), &[]);
        let c = record("http://h/c/", &"c".repeat(100), &[]);
        let budget = a.byte_size() + b.byte_size() + 10;
        let store = InMemoryCacheStore::new(budget);

        store.store(&a.key, a.clone()).await.unwrap();
        store.store(&b.key, b.clone()).await.unwrap();
        // touching `a` makes `b` the eviction candidate
        store.find_all(&a.key).await.unwrap();
        store.store(&c.key, c.clone()).await.unwrap();

        assert!(!store.find_all(&a.key).await.unwrap().is_empty());
        assert!(store.find_all(&b.key).await.unwrap().is_empty());
        assert!(!store.find_all(&c.key).await.unwrap().is_empty());
        assert!(store.size_bytes().await.unwrap() <= budget);
    }

    #[tokio::test]
    async fn test_invalidate_all() {
        let store = InMemoryCacheStore::new(1024);
        let r = record("http://h/flags/", "[]", &[]);
        store.store(&r.key, r.clone()).await.unwrap();
        store.invalidate_all().await;
        assert_eq!(store.size_bytes().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replacing_record_keeps_byte_count_exact() {
        let store = InMemoryCacheStore::new(1024 * 1024);
        let small = record("http://h/flags/", "[]", &[]);
        let large = record("http://h/flags/", &"x".repeat(300), &[]);
        let key = small.key.clone();

        store.store(&key, small).await.unwrap();
        store.store(&key, large.clone()).await.unwrap();
        assert_eq!(store.size_bytes().await.unwrap(), large.byte_size());
    }

    #[tokio::test]
    async fn test_new_key_survives_while_older_are_evicted() {
        let a = record("http://h/a/", &"a".repeat(100), &[]);
        let b = record("http://h/b/", &"b".repeat(100), &[]);
        let c = record("http://h/c/", &"c".repeat(150), &[]);
        let store = InMemoryCacheStore::new(c.byte_size() + 10);

        store.store(&a.key, a.clone()).await.unwrap();
        store.store(&b.key, b.clone()).await.unwrap();
        store.store(&c.key, c.clone()).await.unwrap();

        assert!(store.find_all(&a.key).await.unwrap().is_empty());
        assert!(store.find_all(&b.key).await.unwrap().is_empty());
        assert_eq!(store.find_all(&c.key).await.unwrap().len(), 1);
        assert_eq!(store.size_bytes().await.unwrap(), c.byte_size());
    }

    #[tokio::test]
    async fn test_oversized_entry_is_not_kept() {
        let big = record("http://h/big/", &"x".repeat(500), &[]);
        let store = InMemoryCacheStore::new(100);

        store.store(&big.key, big.clone()).await.unwrap();
        assert!(store.find_all(&big.key).await.unwrap().is_empty());
        assert_eq!(store.size_bytes().await.unwrap(), 0);
    }
}
