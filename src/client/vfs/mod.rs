pub mod ftp;
pub mod sftp;
pub mod webdav;

use super::{Capabilities, ConnectInfo, FileEntry, ProtocolClient, ReadStream, WriteMode, WriteStream};
use crate::descriptor::ConnectionDescriptor;
use crate::error::{Result, StorageError};
use crate::utils::{file_name, join_path, normalize_path};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfsEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait VfsProvider: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    async fn open(&mut self) -> Result<()>;
    async fn probe(&mut self) -> Result<()>;
    async fn read_dir(&mut self, path: &str) -> Result<Vec<VfsEntry>>;
    async fn metadata(&mut self, path: &str) -> Result<VfsEntry>;
    async fn reader(&mut self, path: &str, offset: u64) -> Result<ReadStream>;
    async fn writer(&mut self, path: &str, mode: WriteMode) -> Result<WriteStream>;
    async fn make_dir(&mut self, path: &str) -> Result<()>;
    async fn make_file(&mut self, path: &str) -> Result<()>;
    async fn remove(&mut self, path: &str, is_dir: bool) -> Result<()>;
    async fn rename(&mut self, from: &str, to: &str, replace: bool) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Runs a provider call; on an expired session reconnects and runs it
/// exactly once more.
macro_rules! retry_once {
    ($self:ident, $call:expr) => {{
        match $call {
            Err(err) if err.is_session_expired() => {
                debug!(host = %$self.descriptor.host, "session expired, reconnecting once");
                $self.reconnect().await.map_err(StorageError::surfaced)?;
                $call.map_err(StorageError::surfaced)
            }
            other => other,
        }
    }};
}

pub struct VfsClient<P> {
    descriptor: ConnectionDescriptor,
    provider: P,
    connected: bool,
}

impl<P: VfsProvider> VfsClient<P> {
    pub fn new(descriptor: ConnectionDescriptor, provider: P) -> Self {
        Self {
            descriptor,
            provider,
            connected: false,
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        if let Err(err) = self.provider.close().await {
            debug!(error = %err, "ignoring close failure before reconnect");
        }
        self.provider.open().await
    }

    fn to_entry(&self, path: String, entry: VfsEntry) -> FileEntry {
        FileEntry {
            name: if path == "/" { String::new() } else { file_name(&path) },
            uri: self.descriptor.file_uri(&path),
            path,
            size: if entry.is_dir { None } else { entry.size },
            modified: entry.modified,
            is_directory: entry.is_dir,
        }
    }

    async fn remove_tree(&mut self, root: &str) -> Result<()> {
        let mut pending = vec![(root.to_string(), false)];
        while let Some((dir, expanded)) = pending.pop() {
            if expanded {
                retry_once!(self, self.provider.remove(&dir, true).await)?;
                continue;
            }
            pending.push((dir.clone(), true));
            let children = retry_once!(self, self.provider.read_dir(&dir).await)?;
            for child in children {
                let path = join_path(&dir, &child.name);
                if child.is_dir {
                    pending.push((path, false));
                } else {
                    retry_once!(self, self.provider.remove(&path, false).await)?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<P: VfsProvider> ProtocolClient for VfsClient<P> {
    fn capabilities(&self) -> Capabilities {
        self.provider.capabilities()
    }

    async fn connect(&mut self) -> Result<ConnectInfo> {
        self.provider.open().await?;
        self.connected = true;
        info!(
            storage = %self.descriptor.storage,
            host = %self.descriptor.host,
            "connection established"
        );
        Ok(ConnectInfo::default())
    }

    async fn is_alive(&mut self) -> bool {
        self.connected && self.provider.probe().await.is_ok()
    }

    async fn list(&mut self, path: &str) -> Result<Vec<FileEntry>> {
        let path = normalize_path(path);
        let entries = retry_once!(self, self.provider.read_dir(&path).await)?;
        Ok(entries
            .into_iter()
            .filter(|entry| entry.name != "." && entry.name != "..")
            .map(|entry| {
                let child = join_path(&path, &entry.name);
                self.to_entry(child, entry)
            })
            .collect())
    }

    async fn stat(&mut self, path: &str) -> Result<FileEntry> {
        let path = normalize_path(path);
        let entry = retry_once!(self, self.provider.metadata(&path).await)?;
        Ok(self.to_entry(path, entry))
    }

    async fn open_read(&mut self, path: &str, offset: u64) -> Result<ReadStream> {
        if offset > 0 && !self.capabilities().random_access_read {
            return Err(StorageError::ProtocolError(format!(
                "{} client does not support random_access_read",
                self.descriptor.storage
            )));
        }
        let path = normalize_path(path);
        retry_once!(self, self.provider.reader(&path, offset).await)
    }

    async fn open_write(&mut self, path: &str, mode: WriteMode) -> Result<WriteStream> {
        if mode == WriteMode::Append && !self.capabilities().append {
            return Err(StorageError::ProtocolError(format!(
                "{} client does not support append writes",
                self.descriptor.storage
            )));
        }
        let path = normalize_path(path);
        retry_once!(self, self.provider.writer(&path, mode).await)
    }

    async fn create(&mut self, path: &str, is_directory: bool) -> Result<FileEntry> {
        let path = normalize_path(path);
        match self.stat(&path).await {
            Ok(_) => return Err(StorageError::AlreadyExists(path)),
            Err(StorageError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        if is_directory {
            retry_once!(self, self.provider.make_dir(&path).await)?;
        } else {
            retry_once!(self, self.provider.make_file(&path).await)?;
        }
        self.stat(&path).await
    }

    async fn delete(&mut self, path: &str) -> Result<()> {
        let entry = self.stat(path).await?;
        if entry.path == "/" {
            return Err(StorageError::PermissionDenied(entry.path));
        }
        if entry.is_directory {
            self.remove_tree(&entry.path).await
        } else {
            retry_once!(self, self.provider.remove(&entry.path, false).await)
        }
    }

    async fn rename(&mut self, from: &str, to: &str, replace: bool) -> Result<()> {
        let from = normalize_path(from);
        let to = normalize_path(to);
        retry_once!(self, self.provider.rename(&from, &to, replace).await)
    }

    async fn disconnect(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        if let Err(err) = self.provider.close().await {
            warn!(host = %self.descriptor.host, error = %err, "error while closing connection");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::StorageType;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeProvider {
        tree: BTreeMap<String, bool>,
        expire_next: usize,
        opens: Arc<Mutex<usize>>,
        removed: Arc<Mutex<Vec<String>>>,
    }

    impl FakeProvider {
        fn expire(&mut self) -> Result<()> {
            if self.expire_next > 0 {
                self.expire_next -= 1;
                return Err(StorageError::SessionExpired);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl VfsProvider for FakeProvider {
        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }

        async fn open(&mut self) -> Result<()> {
            *self.opens.lock().unwrap() += 1;
            Ok(())
        }

        async fn probe(&mut self) -> Result<()> {
            Ok(())
        }

        async fn read_dir(&mut self, path: &str) -> Result<Vec<VfsEntry>> {
            self.expire()?;
            let prefix = if path == "/" { "/".to_string() } else { format!("{path}/") };
            Ok(self
                .tree
                .iter()
                .filter(|(p, _)| p.starts_with(&prefix) && !p[prefix.len()..].contains('/'))
                .map(|(p, is_dir)| VfsEntry {
                    name: file_name(p),
                    is_dir: *is_dir,
                    size: Some(1),
                    modified: None,
                })
                .collect())
        }

        async fn metadata(&mut self, path: &str) -> Result<VfsEntry> {
            self.expire()?;
            if path == "/" {
                return Ok(VfsEntry { name: String::new(), is_dir: true, size: None, modified: None });
            }
            self.tree
                .get(path)
                .map(|is_dir| VfsEntry {
                    name: file_name(path),
                    is_dir: *is_dir,
                    size: Some(1),
                    modified: None,
                })
                .ok_or_else(|| StorageError::NotFound(path.to_string()))
        }

        async fn reader(&mut self, _path: &str, _offset: u64) -> Result<ReadStream> {
            Ok(ReadStream::new(tokio::io::empty()))
        }

        async fn writer(&mut self, _path: &str, _mode: WriteMode) -> Result<WriteStream> {
            Ok(WriteStream::spawn(|_source| async { Ok(()) }))
        }

        async fn make_dir(&mut self, path: &str) -> Result<()> {
            self.tree.insert(path.to_string(), true);
            Ok(())
        }

        async fn make_file(&mut self, path: &str) -> Result<()> {
            self.tree.insert(path.to_string(), false);
            Ok(())
        }

        async fn remove(&mut self, path: &str, _is_dir: bool) -> Result<()> {
            self.tree.remove(path);
            self.removed.lock().unwrap().push(path.to_string());
            Ok(())
        }

        async fn rename(&mut self, _from: &str, _to: &str, _replace: bool) -> Result<()> {
            self.expire()
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn client(provider: FakeProvider) -> VfsClient<FakeProvider> {
        VfsClient::new(ConnectionDescriptor::new(StorageType::Sftp, "host"), provider)
    }

    #[tokio::test]
    async fn test_session_expiry_is_retried_once() {
        let opens = Arc::new(Mutex::new(0));
        let mut tree = BTreeMap::new();
        tree.insert("/a.txt".to_string(), false);
        let mut client = client(FakeProvider {
            tree,
            expire_next: 1,
            opens: Arc::clone(&opens),
            ..FakeProvider::default()
        });
        client.connect().await.unwrap();

        let entries = client.list("/").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].uri, "sftp://host/a.txt");
        assert_eq!(*opens.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_second_expiry_surfaces_as_protocol_error() {
        let mut client = client(FakeProvider {
            expire_next: 2,
            ..FakeProvider::default()
        });
        client.connect().await.unwrap();

        let err = client.rename("/a", "/b", false).await.unwrap_err();
        assert!(matches!(err, StorageError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn test_create_refuses_existing_entry() {
        let mut tree = BTreeMap::new();
        tree.insert("/docs".to_string(), true);
        let mut client = client(FakeProvider { tree, ..FakeProvider::default() });

        let err = client.create("/docs", true).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));

        let created = client.create("/docs/new.txt", false).await.unwrap();
        assert!(!created.is_directory);
        assert_eq!(created.name, "new.txt");
    }

    #[tokio::test]
    async fn test_delete_directory_removes_children_first() {
        let removed = Arc::new(Mutex::new(Vec::new()));
        let mut tree = BTreeMap::new();
        tree.insert("/d".to_string(), true);
        tree.insert("/d/f".to_string(), false);
        tree.insert("/d/sub".to_string(), true);
        tree.insert("/d/sub/g".to_string(), false);
        let mut client = client(FakeProvider {
            tree,
            removed: Arc::clone(&removed),
            ..FakeProvider::default()
        });

        client.delete("/d").await.unwrap();
        let removed = removed.lock().unwrap().clone();
        assert_eq!(removed.last().map(String::as_str), Some("/d"));
        let sub = removed.iter().position(|p| p == "/d/sub").unwrap();
        let g = removed.iter().position(|p| p == "/d/sub/g").unwrap();
        assert!(g < sub);
    }

    #[tokio::test]
    async fn test_missing_capabilities_are_reported() {
        let mut client = client(FakeProvider::default());
        let err = client.open_read("/a", 5).await.err().unwrap();
        assert!(matches!(err, StorageError::ProtocolError(_)));
        let err = client.open_write("/a", WriteMode::Append).await.err().unwrap();
        assert!(matches!(err, StorageError::ProtocolError(_)));
    }
}
