use crate::cache::{DirectoryCache, Listing};
use crate::checker::{ConnectionChecker, ConnectionResult};
use crate::client::{ClientFactory, DefaultClientFactory, FileEntry, ReadStream};
use crate::descriptor::ConnectionDescriptor;
use crate::error::{Result, StorageError};
use crate::session::{ClientGuard, Session, SessionRegistry};
use crate::settings::AccessSettings;
use crate::transfer::OutputStream;
use crate::utils::{normalize_path, parent_path};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub async fn with_cancel<T, F>(token: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        () = token.cancelled() => Err(StorageError::Cancelled),
        result = fut => result,
    }
}

/// Entry point for hosts. Idle sessions are only closed while the task from
/// [`StorageAccess::start_maintenance`] runs.
pub struct StorageAccess {
    settings: AccessSettings,
    registry: SessionRegistry,
    cache: Arc<DirectoryCache>,
    checker: ConnectionChecker,
}

impl StorageAccess {
    pub fn new(settings: AccessSettings) -> Self {
        let factory = Arc::new(DefaultClientFactory::new(settings.clone()));
        Self::with_factory(settings, factory)
    }

    pub fn with_factory(settings: AccessSettings, factory: Arc<dyn ClientFactory>) -> Self {
        let registry = SessionRegistry::new(Arc::clone(&factory), settings.clone());
        let checker = ConnectionChecker::new(registry.clone(), factory, settings.clone());
        Self {
            cache: Arc::new(DirectoryCache::new(settings.cache_ttl())),
            settings,
            registry,
            checker,
        }
    }

    /// Starts the idle-session reaper. It stops on its own once this
    /// instance is dropped; aborting the handle stops it earlier.
    pub fn start_maintenance(&self) -> JoinHandle<()> {
        let interval = (self.settings.idle_timeout() / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
        self.registry.spawn_maintenance(interval)
    }

    pub fn settings(&self) -> &AccessSettings {
        &self.settings
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &DirectoryCache {
        &self.cache
    }

    async fn client(&self, descriptor: &ConnectionDescriptor) -> Result<(Arc<Session>, ClientGuard)> {
        let session = self.registry.acquire(descriptor).await?;
        match session.lock().await {
            Ok(client) => Ok((session, client)),
            Err(StorageError::SessionExpired) => {
                debug!(session = session.id(), "session closed under us, acquiring again");
                let session = self.registry.acquire(descriptor).await?;
                let client = session.lock().await.map_err(StorageError::surfaced)?;
                Ok((session, client))
            }
            Err(err) => Err(err),
        }
    }

    async fn fetch_listing(&self, descriptor: &ConnectionDescriptor, path: &str) -> Result<Vec<FileEntry>> {
        let (_, mut client) = self.client(descriptor).await?;
        client.list(path).await
    }

    pub async fn list_children(&self, descriptor: &ConnectionDescriptor, path: &str) -> Result<Listing> {
        let path = normalize_path(path);
        self.cache
            .get_or_load(descriptor, &path, || self.fetch_listing(descriptor, &path))
            .await
    }

    pub async fn reload_children(&self, descriptor: &ConnectionDescriptor, path: &str) -> Result<Listing> {
        let path = normalize_path(path);
        self.cache.invalidate(descriptor, &path);
        self.list_children(descriptor, &path).await
    }

    pub async fn list_folders(&self, descriptor: &ConnectionDescriptor, path: &str) -> Result<Vec<FileEntry>> {
        let listing = self.list_children(descriptor, path).await?;
        let mut folders: Vec<FileEntry> = listing.iter().filter(|e| e.is_directory).cloned().collect();
        folders.sort_by_key(|e| e.name.to_lowercase());
        Ok(folders)
    }

    pub async fn stat_file(&self, descriptor: &ConnectionDescriptor, path: &str) -> Result<FileEntry> {
        let path = normalize_path(path);
        if path != "/" {
            if let Some(listing) = self.cache.get(descriptor, &parent_path(&path)) {
                return listing
                    .iter()
                    .find(|e| e.path == path)
                    .cloned()
                    .ok_or(StorageError::NotFound(path));
            }
        }
        let (_, mut client) = self.client(descriptor).await?;
        client.stat(&path).await
    }

    pub async fn open_input_stream(&self, descriptor: &ConnectionDescriptor, path: &str) -> Result<ReadStream> {
        self.open_input_stream_at(descriptor, path, 0).await
    }

    /// Reads from `offset`; fails unless the client supports random access.
    pub async fn open_input_stream_at(
        &self,
        descriptor: &ConnectionDescriptor,
        path: &str,
        offset: u64,
    ) -> Result<ReadStream> {
        let (session, mut client) = self.client(descriptor).await?;
        let stream = client.open_read(&normalize_path(path), offset).await?;
        Ok(stream.holding(session.lease()))
    }

    pub async fn open_output_stream(
        &self,
        descriptor: &ConnectionDescriptor,
        path: &str,
        append: bool,
    ) -> Result<OutputStream> {
        let session = self.registry.acquire(descriptor).await?;
        OutputStream::open(&self.registry, session, Arc::clone(&self.cache), descriptor, path, append).await
    }

    pub async fn create_file(
        &self,
        descriptor: &ConnectionDescriptor,
        path: &str,
        is_directory: bool,
    ) -> Result<FileEntry> {
        let path = normalize_path(path);
        let created = {
            let (_, mut client) = self.client(descriptor).await?;
            client.create(&path, is_directory).await
        };
        self.cache.invalidate(descriptor, &parent_path(&path));
        created
    }

    pub async fn delete_file(&self, descriptor: &ConnectionDescriptor, path: &str) -> Result<()> {
        let path = normalize_path(path);
        let deleted = {
            let (_, mut client) = self.client(descriptor).await?;
            client.delete(&path).await
        };
        self.cache.invalidate(descriptor, &parent_path(&path));
        self.cache.invalidate_tree(descriptor, &path);
        deleted
    }

    /// Renames without replacing: an existing `to` is `AlreadyExists`.
    /// Returns the entry under its new name.
    pub async fn rename_file(&self, descriptor: &ConnectionDescriptor, from: &str, to: &str) -> Result<FileEntry> {
        let from = normalize_path(from);
        let to = normalize_path(to);
        let (moved, renamed) = {
            let (_, mut client) = self.client(descriptor).await?;
            // Servers that match names case-insensitively report a case-only
            // rename target as the source itself.
            let exists = if from.eq_ignore_ascii_case(&to) {
                Err(StorageError::NotFound(to.clone()))
            } else {
                client.stat(&to).await
            };
            let moved = match exists {
                Ok(_) => Err(StorageError::AlreadyExists(to.clone())),
                Err(StorageError::NotFound(_)) => client.rename(&from, &to, false).await,
                Err(err) => Err(err),
            };
            match moved {
                Ok(()) => (true, client.stat(&to).await),
                Err(err) => (false, Err(err)),
            }
        };
        if moved {
            self.cache.invalidate(descriptor, &parent_path(&from));
            self.cache.invalidate(descriptor, &parent_path(&to));
            self.cache.invalidate_tree(descriptor, &from);
        }
        renamed
    }

    pub async fn check_connection(&self, descriptor: &ConnectionDescriptor) -> ConnectionResult {
        self.checker.check(descriptor).await
    }

    pub async fn close_connection(&self, descriptor: &ConnectionDescriptor) {
        self.registry.evict(descriptor).await;
        self.cache.invalidate_all(descriptor);
    }

    pub async fn close_connection_id(&self, id: &str) -> usize {
        self.cache.invalidate_id(id);
        self.registry.evict_id(id).await
    }

    pub async fn close_all(&self) {
        info!("closing storage access");
        self.registry.evict_all().await;
        self.cache.clear();
    }
}
