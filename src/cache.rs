use crate::client::FileEntry;
use crate::descriptor::ConnectionDescriptor;
use crate::error::Result;
use crate::utils::{is_within, normalize_path};
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

pub type Listing = Arc<Vec<FileEntry>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    descriptor: ConnectionDescriptor,
    path: String,
}

impl CacheKey {
    fn new(descriptor: &ConnectionDescriptor, path: &str) -> Self {
        Self {
            descriptor: descriptor.clone(),
            path: normalize_path(path),
        }
    }
}

struct CachedListing {
    entries: Listing,
    stored_at: Instant,
}

impl CachedListing {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.stored_at.elapsed() < ttl
    }
}

pub struct DirectoryCache {
    ttl: Duration,
    entries: DashMap<CacheKey, CachedListing>,
    loads: DashMap<CacheKey, Arc<Mutex<()>>>,
    epoch: AtomicU64,
}

impl DirectoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
            loads: DashMap::new(),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, descriptor: &ConnectionDescriptor, path: &str) -> Option<Listing> {
        self.lookup(&CacheKey::new(descriptor, path))
    }

    fn lookup(&self, key: &CacheKey) -> Option<Listing> {
        let stale = match self.entries.get(key) {
            Some(cached) if cached.is_fresh(self.ttl) => {
                debug!(path = %key.path, "listing cache hit");
                return Some(Arc::clone(&cached.entries));
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            self.entries.remove_if(key, |_, cached| !cached.is_fresh(self.ttl));
        }
        debug!(path = %key.path, "listing cache miss");
        None
    }

    pub fn put(&self, descriptor: &ConnectionDescriptor, path: &str, entries: Vec<FileEntry>) -> Listing {
        let entries = Arc::new(entries);
        self.store(CacheKey::new(descriptor, path), Arc::clone(&entries));
        entries
    }

    fn store(&self, key: CacheKey, entries: Listing) {
        self.entries.insert(
            key,
            CachedListing {
                entries,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, descriptor: &ConnectionDescriptor, path: &str) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.entries.remove(&CacheKey::new(descriptor, path));
    }

    pub fn invalidate_tree(&self, descriptor: &ConnectionDescriptor, path: &str) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let root = normalize_path(path);
        self.entries
            .retain(|key, _| !(key.descriptor == *descriptor && is_within(&key.path, &root)));
    }

    pub fn invalidate_all(&self, descriptor: &ConnectionDescriptor) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.entries.retain(|key, _| key.descriptor != *descriptor);
    }

    pub fn invalidate_id(&self, id: &str) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.entries.retain(|key, _| key.descriptor.id != id);
    }

    pub fn clear(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.entries.clear();
    }

    /// Cached listing, or the result of `load`. Concurrent misses on the same
    /// key wait for the first loader instead of hitting the server again.
    pub async fn get_or_load<F, Fut>(
        &self,
        descriptor: &ConnectionDescriptor,
        path: &str,
        load: F,
    ) -> Result<Listing>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<FileEntry>>>,
    {
        let key = CacheKey::new(descriptor, path);
        if let Some(hit) = self.lookup(&key) {
            return Ok(hit);
        }

        let gate = Arc::clone(self.loads.entry(key.clone()).or_default().value());
        let result = {
            let _loading = gate.lock().await;
            match self.lookup(&key) {
                Some(hit) => Ok(hit),
                None => self.load_into(&key, load).await,
            }
        };
        self.loads
            .remove_if(&key, |_, current| Arc::ptr_eq(current, &gate) && Arc::strong_count(current) <= 2);
        result
    }

    async fn load_into<F, Fut>(&self, key: &CacheKey, load: F) -> Result<Listing>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<FileEntry>>>,
    {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let entries = Arc::new(load().await?);
        if self.epoch.load(Ordering::SeqCst) == epoch {
            self.store(key.clone(), Arc::clone(&entries));
        } else {
            debug!(path = %key.path, "listing raced an invalidation, not caching it");
        }
        Ok(entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::StorageType;
    use crate::error::StorageError;
    use std::sync::atomic::AtomicUsize;

    fn entry(name: &str) -> FileEntry {
        FileEntry {
            name: name.to_string(),
            path: format!("/{name}"),
            uri: format!("ftp://host/{name}"),
            size: Some(1),
            modified: None,
            is_directory: false,
        }
    }

    fn descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor::new(StorageType::Ftp, "host")
    }

    #[test]
    fn test_put_then_get_with_normalized_path() {
        let cache = DirectoryCache::new(Duration::from_secs(30));
        cache.put(&descriptor(), "/docs/", vec![entry("a")]);

        let hit = cache.get(&descriptor(), "docs").unwrap();
        assert_eq!(hit.len(), 1);
        assert!(cache.get(&ConnectionDescriptor::new(StorageType::Ftp, "other"), "/docs").is_none());
    }

    #[test]
    fn test_expired_listing_is_dropped() {
        let cache = DirectoryCache::new(Duration::ZERO);
        cache.put(&descriptor(), "/", vec![entry("a")]);
        assert!(cache.get(&descriptor(), "/").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_tree_keeps_siblings() {
        let cache = DirectoryCache::new(Duration::from_secs(30));
        let d = descriptor();
        cache.put(&d, "/a", vec![]);
        cache.put(&d, "/a/b", vec![]);
        cache.put(&d, "/ab", vec![]);

        cache.invalidate_tree(&d, "/a");

        assert!(cache.get(&d, "/a").is_none());
        assert!(cache.get(&d, "/a/b").is_none());
        assert!(cache.get(&d, "/ab").is_some());
    }

    #[test]
    fn test_invalidate_all_only_touches_one_connection() {
        let cache = DirectoryCache::new(Duration::from_secs(30));
        let other = ConnectionDescriptor::new(StorageType::Sftp, "host");
        cache.put(&descriptor(), "/", vec![]);
        cache.put(&other, "/", vec![]);

        cache.invalidate_all(&descriptor());

        assert!(cache.get(&descriptor(), "/").is_none());
        assert!(cache.get(&other, "/").is_some());
    }

    #[tokio::test]
    async fn test_concurrent_misses_load_once() {
        let cache = Arc::new(DirectoryCache::new(Duration::from_secs(30)));
        let loads = Arc::new(AtomicUsize::new(0));

        let tasks = (0..8).map(|_| {
            let cache = Arc::clone(&cache);
            let loads = Arc::clone(&loads);
            tokio::spawn(async move {
                cache
                    .get_or_load(&descriptor(), "/", || async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(vec![entry("a")])
                    })
                    .await
            })
        });

        for result in futures::future::join_all(tasks).await {
            assert_eq!(result.unwrap().unwrap().len(), 1);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_load_racing_invalidation_is_not_stored() {
        let cache = DirectoryCache::new(Duration::from_secs(30));
        let d = descriptor();

        let listing = cache
            .get_or_load(&d, "/", || async {
                cache.invalidate(&d, "/");
                Ok(vec![entry("stale")])
            })
            .await
            .unwrap();

        assert_eq!(listing[0].name, "stale");
        assert!(cache.get(&d, "/").is_none());
    }

    #[tokio::test]
    async fn test_failed_load_is_not_cached() {
        let cache = DirectoryCache::new(Duration::from_secs(30));
        let err = cache
            .get_or_load(&descriptor(), "/", || async {
                Err(StorageError::PermissionDenied("/".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::PermissionDenied(_)));
        assert!(cache.is_empty());
    }
}
