use crate::{CacheError, CacheKey, CacheRecord, VaryKeys};
use async_trait::async_trait;
use std::sync::Arc;

pub type SharedHttpCache = Arc<dyn HttpCacheStore>;

/// Storage capability behind the caching http client. Implementations decide
/// where records live; the caching rules are written once against this trait.
#[async_trait]
pub trait HttpCacheStore: Send + Sync {
    /// Record stored under `key` whose vary keys equal `vary_keys` exactly.
    async fn find(
        &self,
        key: &CacheKey,
        vary_keys: &VaryKeys,
    ) -> Result<Option<CacheRecord>, CacheError> {
        let records = self.find_all(key).await?;
        Ok(records.into_iter().find(|r| &r.vary_keys == vary_keys))
    }

    /// Every record stored under `key`. Unreadable data yields an empty list.
    async fn find_all(&self, key: &CacheKey) -> Result<Vec<CacheRecord>, CacheError>;

    /// Insert or replace the record with the same vary keys, then trim the
    /// store back under its byte budget.
    async fn store(&self, key: &CacheKey, record: CacheRecord) -> Result<(), CacheError>;

    /// Drop everything. Failures are logged, never returned.
    async fn invalidate_all(&self);

    /// Bytes currently held by the store.
    async fn size_bytes(&self) -> Result<u64, CacheError>;
}
