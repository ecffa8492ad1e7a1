//! HTTP response cache for the Flagsmith client.
//!
//! Records are grouped per request identity ([`CacheKey`]) and, inside a key,
//! per set of vary headers. Stores implement [`HttpCacheStore`]:
//! - [`FileCacheStore`]: one file per key on disk, survives restarts
//! - [`InMemoryCacheStore`]: process-local map
//!
//! Both keep themselves under a byte budget by evicting whole keys, oldest
//! first.

mod cache;
pub mod codec;
mod error;
mod file;
mod http_cache;
mod memory;

pub use cache::{CacheEntry, CacheKey, CacheRecord, VaryKeys};
pub use error::CacheError;
pub use file::{CACHE_SUBDIR, FileCacheStore};
pub use http_cache::{HttpCacheStore, SharedHttpCache};
pub use memory::InMemoryCacheStore;
