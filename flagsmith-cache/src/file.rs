//! Disk-backed [`HttpCacheStore`].
//!
//! One file per [`CacheKey`] (named by its hex form) inside a dedicated
//! `flagsmith` subdirectory. Files are written to a temporary sibling and
//! renamed into place so readers never observe a half-written entry; if one
//! does turn up anyway (crash, foreign write) the codec rejects it and the
//! entry is treated as a miss.
//!
//! Access to a key is serialized through a per-key async mutex. Distinct keys
//! proceed concurrently. A key's mutex lives in the map only while someone
//! holds or waits for it.
use crate::{
    CacheEntry, CacheError, CacheKey, CacheRecord, HttpCacheStore,
    codec::{decode_entry, encode_entry},
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::SystemTime,
};
use tokio::{fs, sync::OwnedMutexGuard};
use tracing::{debug, trace, warn};

pub const CACHE_SUBDIR: &str = "flagsmith";
const TMP_SUFFIX: &str = ".tmp";

type KeyLock = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug)]
pub struct FileCacheStore {
    dir: PathBuf,
    max_size_bytes: u64,
    locks: Mutex<HashMap<CacheKey, KeyLock>>,
}

/// Held key lock. Dropping it releases the key and forgets its mutex once
/// nobody else is waiting.
struct KeyGuard<'a> {
    locks: &'a Mutex<HashMap<CacheKey, KeyLock>>,
    key: CacheKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        drop(self.guard.take());
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

#[derive(Debug)]
struct CacheFile {
    key: CacheKey,
    size: u64,
    modified: SystemTime,
}

impl FileCacheStore {
    /// Store rooted at `base_dir/flagsmith`. Nothing touches the disk until
    /// the first write.
    pub fn new(base_dir: impl AsRef<Path>, max_size_bytes: u64) -> Self {
        Self {
            dir: base_dir.as_ref().join(CACHE_SUBDIR),
            max_size_bytes,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.as_str())
    }

    fn key_lock(&self, key: &CacheKey) -> Result<KeyLock, CacheError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| CacheError::Lock(e.to_string()))?;
        Ok(locks.entry(key.clone()).or_default().clone())
    }

    async fn lock_key(&self, key: &CacheKey) -> Result<KeyGuard<'_>, CacheError> {
        let guard = self.key_lock(key)?.lock_owned().await;
        Ok(KeyGuard {
            locks: &self.locks,
            key: key.clone(),
            guard: Some(guard),
        })
    }

    /// `None` while another task holds or awaits the key.
    fn try_lock_key(&self, key: &CacheKey) -> Result<Option<KeyGuard<'_>>, CacheError> {
        Ok(self
            .key_lock(key)?
            .try_lock_owned()
            .ok()
            .map(|guard| KeyGuard {
                locks: &self.locks,
                key: key.clone(),
                guard: Some(guard),
            }))
    }

    /// Read and decode one entry. Caller holds the key lock.
    async fn read_entry(&self, key: &CacheKey) -> Result<CacheEntry, CacheError> {
        let path = self.path_for(key);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(CacheEntry::default()),
            Err(e) => return Err(e.into()),
        };

        match decode_entry(&data) {
            Ok(entry) => Ok(entry),
            Err(err) => {
                warn!(key = %key, ?err, "dropping unreadable cache file");
                if let Err(e) = fs::remove_file(&path).await {
                    if e.kind() != ErrorKind::NotFound {
                        warn!(key = %key, error = ?e, "failed to remove corrupt cache file");
                    }
                }
                Ok(CacheEntry::default())
            }
        }
    }

    /// Write through a temporary file and rename. Caller holds the key lock.
    async fn write_entry(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), CacheError> {
        let encoded = encode_entry(entry)?;
        let path = self.path_for(key);
        let tmp = self.dir.join(format!("{}{TMP_SUFFIX}", key.as_str()));
        fs::write(&tmp, &encoded).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        trace!(key = %key, bytes = encoded.len(), "cache entry written");
        Ok(())
    }

    /// Live entries on disk. Temporary files left behind by an interrupted
    /// write are removed on the way unless their key is currently locked.
    async fn list_files(&self) -> Result<Vec<CacheFile>, CacheError> {
        let mut files = Vec::new();
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };

        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(key) = name.strip_suffix(TMP_SUFFIX).and_then(CacheKey::from_hex) {
                self.remove_stale_tmp(&key, &item.path()).await?;
                continue;
            }
            let Some(key) = CacheKey::from_hex(name) else {
                continue;
            };
            // the file may vanish between listing and stat
            let metadata = match item.metadata().await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if !metadata.is_file() {
                continue;
            }
            files.push(CacheFile {
                key,
                size: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(files)
    }

    async fn remove_stale_tmp(&self, key: &CacheKey, path: &Path) -> Result<(), CacheError> {
        let Some(_guard) = self.try_lock_key(key)? else {
            return Ok(());
        };
        match fs::remove_file(path).await {
            Ok(()) => debug!(key = %key, "removed stale temporary cache file"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(key = %key, error = ?e, "failed to remove temporary cache file"),
        }
        Ok(())
    }

    /// Delete whole entries, oldest modification first, until the store fits
    /// its budget. `just_written` survives unless it alone exceeds the budget.
    async fn trim(&self, just_written: &CacheKey) -> Result<(), CacheError> {
        let mut files = self.list_files().await?;
        let mut total: u64 = files.iter().map(|f| f.size).sum();
        if total <= self.max_size_bytes {
            return Ok(());
        }

        files.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.key.cmp(&b.key)));
        let (newest, mut candidates): (Vec<_>, Vec<_>) =
            files.into_iter().partition(|f| &f.key == just_written);
        // an entry larger than the whole budget cannot be kept either
        candidates.extend(newest.into_iter().filter(|f| f.size > self.max_size_bytes));

        for file in candidates {
            if total <= self.max_size_bytes {
                break;
            }
            let _guard = self.lock_key(&file.key).await?;
            match fs::remove_file(self.path_for(&file.key)).await {
                Ok(()) => {
                    debug!(key = %file.key, size = file.size, "evicted cache entry");
                    total = total.saturating_sub(file.size);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    total = total.saturating_sub(file.size);
                }
                Err(e) => {
                    warn!(key = %file.key, error = ?e, "failed to evict cache entry");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl HttpCacheStore for FileCacheStore {
    async fn find_all(&self, key: &CacheKey) -> Result<Vec<CacheRecord>, CacheError> {
        let _guard = self.lock_key(key).await?;
        Ok(self.read_entry(key).await?.records)
    }

    async fn store(&self, key: &CacheKey, record: CacheRecord) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir).await?;
        {
            let _guard = self.lock_key(key).await?;
            let mut entry = self.read_entry(key).await?;
            entry.upsert(record);
            self.write_entry(key, &entry).await?;
        }

        if let Err(err) = self.trim(key).await {
            warn!(?err, "cache trim failed");
        }
        Ok(())
    }

    async fn invalidate_all(&self) {
        // mutexes orphaned by a cancelled lock wait
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, lock| Arc::strong_count(lock) > 1);
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => debug!(dir = %self.dir.display(), "cache invalidated"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(dir = %self.dir.display(), error = ?e, "failed to invalidate cache")
            }
        }
    }

    async fn size_bytes(&self) -> Result<u64, CacheError> {
        Ok(self.list_files().await?.iter().map(|f| f.size).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::record;
    use crate::VaryKeys;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_store_and_find() {
        let tmp = TempDir::new().unwrap();
        let store = FileCacheStore::new(tmp.path(), 1024 * 1024);
        let r = record("http://h/flags/", "[1]", &[]);
        let key = r.key.clone();

        store.store(&key, r.clone()).await.unwrap();
        let found = store.find(&key, &VaryKeys::new()).await.unwrap().unwrap();
        assert_eq!(found.body, r.body);
        assert!(store.path_for(&key).exists());
    }

    #[tokio::test]
    async fn test_store_twice_keeps_one_record() {
        let tmp = TempDir::new().unwrap();
        let store = FileCacheStore::new(tmp.path(), 1024 * 1024);
        let r = record("http://h/flags/", "[1]", &[("accept", "json")]);
        let key = r.key.clone();

        store.store(&key, r.clone()).await.unwrap();
        store.store(&key, r.clone()).await.unwrap();
        let all = store.find_all(&key).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].body, r.body);
    }

    #[tokio::test]
    async fn test_vary_keys_disambiguate() {
        let tmp = TempDir::new().unwrap();
        let store = FileCacheStore::new(tmp.path(), 1024 * 1024);
        let json = record("http://h/flags/", "json", &[("accept", "application/json")]);
        let text = record("http://h/flags/", "text", &[("accept", "text/plain")]);
        let key = json.key.clone();

        store.store(&key, json).await.unwrap();
        store.store(&key, text).await.unwrap();

        assert_eq!(store.find_all(&key).await.unwrap().len(), 2);
        let vary: VaryKeys = [("accept".to_string(), "text/plain".to_string())].into();
        let found = store.find(&key, &vary).await.unwrap().unwrap();
        assert_eq!(found.body, bytes::Bytes::from("text"));
        assert!(store.find(&key, &VaryKeys::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_key_is_a_miss() {
        let tmp = TempDir::new().unwrap();
        let store = FileCacheStore::new(tmp.path(), 1024);
        let r = record("http://h/flags/", "", &[]);
        assert!(store.find_all(&r.key).await.unwrap().is_empty());
        assert_eq!(store.size_bytes().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_miss_and_removed() {
        let tmp = TempDir::new().unwrap();
        let store = FileCacheStore::new(tmp.path(), 1024 * 1024);
        let r = record("http://h/flags/", "[1]", &[]);
        let key = r.key.clone();
        store.store(&key, r).await.unwrap();

        let path = store.path_for(&key);
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() / 2]).unwrap();

        assert!(store.find_all(&key).await.unwrap().is_empty());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_invalidate_all() {
        let tmp = TempDir::new().unwrap();
        let store = FileCacheStore::new(tmp.path(), 1024 * 1024);
        let r = record("http://h/flags/", "[1]", &[]);
        let key = r.key.clone();
        store.store(&key, r).await.unwrap();

        store.invalidate_all().await;
        assert!(store.find_all(&key).await.unwrap().is_empty());
        // second call on a missing directory is a no-op
        store.invalidate_all().await;
    }

    #[tokio::test]
    async fn test_oversized_record_is_not_kept() {
        let tmp = TempDir::new().unwrap();
        let store = FileCacheStore::new(tmp.path(), 64);
        let big = "x".repeat(256);
        let r = record("http://h/flags/", &big, &[]);
        let key = r.key.clone();

        store.store(&key, r).await.unwrap();
        assert!(store.find_all(&key).await.unwrap().is_empty());
        assert_eq!(store.size_bytes().await.unwrap(), 0);
    }

    fn held_locks(store: &FileCacheStore) -> usize {
        store.locks.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_key_locks_are_released() {
        let tmp = TempDir::new().unwrap();
        let store = FileCacheStore::new(tmp.path(), 512);
        for i in 0..20 {
            let r = record(&format!("http://h/flags/{i}/"), &"x".repeat(100), &[]);
            let key = r.key.clone();
            store.store(&key, r).await.unwrap();
            store.find_all(&key).await.unwrap();
        }
        assert!(store.size_bytes().await.unwrap() <= 512);
        assert_eq!(held_locks(&store), 0);

        store.invalidate_all().await;
        assert_eq!(held_locks(&store), 0);
    }

    #[tokio::test]
    async fn test_waiting_lock_survives_release() {
        let tmp = TempDir::new().unwrap();
        let store = FileCacheStore::new(tmp.path(), 1024);
        let r = record("http://h/flags/", "[]", &[]);

        let first = store.lock_key(&r.key).await.unwrap();
        assert!(store.try_lock_key(&r.key).unwrap().is_none());
        let waiter = store.key_lock(&r.key).unwrap();
        drop(first);
        // someone still holds a handle, so the mutex stays shared
        assert_eq!(held_locks(&store), 1);
        assert!(waiter.try_lock().is_ok());
        drop(waiter);
        assert!(store.try_lock_key(&r.key).unwrap().is_some());
        assert_eq!(held_locks(&store), 0);
    }

    #[tokio::test]
    async fn test_leftover_temp_file_is_removed() {
        let tmp = TempDir::new().unwrap();
        let store = FileCacheStore::new(tmp.path(), 1024 * 1024);
        let crashed = record("http://h/crashed/", "[1]", &[]);
        std::fs::create_dir_all(store.dir()).unwrap();
        let leftover = store
            .dir()
            .join(format!("{}{TMP_SUFFIX}", crashed.key.as_str()));
        std::fs::write(&leftover, b"half a write").unwrap();
        let unrelated = store.dir().join("notes.tmp");
        std::fs::write(&unrelated, b"keep").unwrap();

        let r = record("http://h/flags/", "[2]", &[]);
        store.store(&r.key, r.clone()).await.unwrap();
        let written = std::fs::metadata(store.path_for(&r.key)).unwrap().len();
        assert_eq!(store.size_bytes().await.unwrap(), written);

        assert!(!leftover.exists());
        assert!(unrelated.exists());
        assert!(store.find_all(&crashed.key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_temp_file_of_locked_key_is_kept() {
        let tmp = TempDir::new().unwrap();
        let store = FileCacheStore::new(tmp.path(), 1024 * 1024);
        let writing = record("http://h/writing/", "[1]", &[]);
        std::fs::create_dir_all(store.dir()).unwrap();
        let pending = store
            .dir()
            .join(format!("{}{TMP_SUFFIX}", writing.key.as_str()));
        std::fs::write(&pending, b"in flight").unwrap();

        let _writer = store.lock_key(&writing.key).await.unwrap();
        store.size_bytes().await.unwrap();
        assert!(pending.exists());
    }
}
