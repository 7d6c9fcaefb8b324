#![allow(dead_code)]

use async_trait::async_trait;
use sharefs::client::{
    Capabilities, ClientFactory, ConnectInfo, FileEntry, ProtocolClient, ReadStream, WriteMode, WriteStream,
};
use sharefs::utils::{file_name, is_within, normalize_path, parent_path};
use sharefs::{AccessSettings, ConnectionDescriptor, StorageAccess, StorageError, StorageType};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;

type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
}

/// A server-side tree shared by every client of one factory.
#[derive(Default)]
pub struct MemoryFs {
    nodes: Mutex<BTreeMap<String, Node>>,
}

impl MemoryFs {
    pub fn mkdir(&self, path: &str) {
        self.nodes.lock().unwrap().insert(normalize_path(path), Node::Dir);
    }

    pub fn write(&self, path: &str, data: &[u8]) {
        self.nodes
            .lock()
            .unwrap()
            .insert(normalize_path(path), Node::File(data.to_vec()));
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.lock().unwrap().get(&normalize_path(path)) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        let path = normalize_path(path);
        path == "/" || self.nodes.lock().unwrap().contains_key(&path)
    }

    /// Names directly inside `dir`.
    pub fn names(&self, dir: &str) -> Vec<String> {
        let dir = normalize_path(dir);
        self.nodes
            .lock()
            .unwrap()
            .keys()
            .filter(|p| **p != dir && parent_path(p) == dir)
            .map(|p| file_name(p))
            .collect()
    }

    fn canonical(&self, path: &str) -> Option<String> {
        self.nodes
            .lock()
            .unwrap()
            .keys()
            .find(|p| p.eq_ignore_ascii_case(path))
            .cloned()
    }

    fn is_dir(&self, path: &str) -> bool {
        path == "/" || matches!(self.nodes.lock().unwrap().get(path), Some(Node::Dir))
    }

    fn append(&self, path: &str, chunk: &[u8]) {
        if let Some(Node::File(data)) = self.nodes.lock().unwrap().get_mut(path) {
            data.extend_from_slice(chunk);
        }
    }
}

/// Knobs shared by the clients a factory creates.
#[derive(Clone)]
pub struct Behaviour {
    pub capabilities: Capabilities,
    pub connect_delay: Duration,
    pub connect_error: Option<StorageError>,
    pub dfs_fallback: bool,
    /// Uploads fail once more than this many bytes arrived.
    pub fail_write_after: Option<usize>,
    /// `stat` matches names ignoring case, like SMB servers do.
    pub case_insensitive: bool,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            capabilities: Capabilities {
                random_access_read: true,
                atomic_replace: true,
                append: true,
            },
            connect_delay: Duration::ZERO,
            connect_error: None,
            dfs_fallback: false,
            fail_write_after: None,
            case_insensitive: false,
        }
    }
}

#[derive(Default)]
pub struct Counters {
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub lists: AtomicUsize,
}

impl Counters {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn lists(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }
}

pub struct MemoryClient {
    fs: Arc<MemoryFs>,
    counters: Arc<Counters>,
    behaviour: Behaviour,
    uri_base: String,
    connected: bool,
}

impl MemoryClient {
    fn entry(&self, path: &str) -> Result<FileEntry> {
        let nodes = self.fs.nodes.lock().unwrap();
        let (is_directory, size) = match nodes.get(path) {
            _ if path == "/" => (true, None),
            Some(Node::Dir) => (true, None),
            Some(Node::File(data)) => (false, Some(data.len() as u64)),
            None => return Err(StorageError::NotFound(path.to_string())),
        };
        Ok(FileEntry {
            name: file_name(path),
            path: path.to_string(),
            uri: format!("{}{}", self.uri_base, path),
            size,
            modified: None,
            is_directory,
        })
    }

    fn require_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(StorageError::ProtocolError("not connected".into()))
        }
    }
}

#[async_trait]
impl ProtocolClient for MemoryClient {
    fn capabilities(&self) -> Capabilities {
        self.behaviour.capabilities
    }

    async fn connect(&mut self) -> Result<ConnectInfo> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.behaviour.connect_delay).await;
        if let Some(err) = &self.behaviour.connect_error {
            return Err(err.clone());
        }
        self.connected = true;
        Ok(ConnectInfo {
            resolved_root: None,
            dfs_fallback: self.behaviour.dfs_fallback,
        })
    }

    async fn is_alive(&mut self) -> bool {
        self.connected
    }

    async fn list(&mut self, path: &str) -> Result<Vec<FileEntry>> {
        self.require_connected()?;
        self.counters.lists.fetch_add(1, Ordering::SeqCst);
        let path = normalize_path(path);
        if !self.fs.is_dir(&path) {
            return Err(StorageError::NotFound(path));
        }
        self.fs
            .names(&path)
            .iter()
            .map(|name| self.entry(&sharefs::utils::join_path(&path, name)))
            .collect()
    }

    async fn stat(&mut self, path: &str) -> Result<FileEntry> {
        self.require_connected()?;
        let path = normalize_path(path);
        match self.fs.canonical(&path) {
            Some(found) if self.behaviour.case_insensitive => self.entry(&found),
            _ => self.entry(&path),
        }
    }

    async fn open_read(&mut self, path: &str, offset: u64) -> Result<ReadStream> {
        self.require_connected()?;
        if offset > 0 && !self.behaviour.capabilities.random_access_read {
            return Err(StorageError::ProtocolError("random_access_read unsupported".into()));
        }
        let path = normalize_path(path);
        let data = self.fs.read(&path).ok_or(StorageError::NotFound(path))?;
        let start = usize::try_from(offset).unwrap().min(data.len());
        Ok(ReadStream::new(Cursor::new(data[start..].to_vec())))
    }

    async fn open_write(&mut self, path: &str, mode: WriteMode) -> Result<WriteStream> {
        self.require_connected()?;
        let path = normalize_path(path);
        if !self.fs.is_dir(&parent_path(&path)) {
            return Err(StorageError::NotFound(parent_path(&path)));
        }
        if mode == WriteMode::Truncate || self.fs.read(&path).is_none() {
            self.fs.write(&path, b"");
        }

        let fs = Arc::clone(&self.fs);
        let limit = self.behaviour.fail_write_after;
        Ok(WriteStream::spawn(move |mut source| async move {
            let mut received = 0usize;
            let mut chunk = vec![0u8; 8192];
            loop {
                let n = source.read(&mut chunk).await?;
                if n == 0 {
                    return Ok(());
                }
                received += n;
                if limit.is_some_and(|limit| received > limit) {
                    return Err(StorageError::IoError("connection reset during upload".into()));
                }
                fs.append(&path, &chunk[..n]);
            }
        }))
    }

    async fn create(&mut self, path: &str, is_directory: bool) -> Result<FileEntry> {
        self.require_connected()?;
        let path = normalize_path(path);
        if self.fs.exists(&path) {
            return Err(StorageError::AlreadyExists(path));
        }
        if !self.fs.is_dir(&parent_path(&path)) {
            return Err(StorageError::NotFound(parent_path(&path)));
        }
        if is_directory {
            self.fs.mkdir(&path);
        } else {
            self.fs.write(&path, b"");
        }
        self.entry(&path)
    }

    async fn delete(&mut self, path: &str) -> Result<()> {
        self.require_connected()?;
        let path = normalize_path(path);
        if !self.fs.exists(&path) {
            return Err(StorageError::NotFound(path));
        }
        self.fs
            .nodes
            .lock()
            .unwrap()
            .retain(|p, _| !is_within(p, &path));
        Ok(())
    }

    async fn rename(&mut self, from: &str, to: &str, replace: bool) -> Result<()> {
        self.require_connected()?;
        let (from, to) = (normalize_path(from), normalize_path(to));
        let mut nodes = self.fs.nodes.lock().unwrap();
        if !nodes.contains_key(&from) {
            return Err(StorageError::NotFound(from));
        }
        if nodes.contains_key(&to) && !replace {
            return Err(StorageError::AlreadyExists(to));
        }
        let moved: Vec<(String, Node)> = nodes
            .iter()
            .filter(|(p, _)| is_within(p, &from))
            .map(|(p, n)| (format!("{}{}", to, &p[from.len()..]), n.clone()))
            .collect();
        nodes.retain(|p, _| !is_within(p, &from) && !is_within(p, &to));
        nodes.extend(moved);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.connected {
            self.connected = false;
            self.counters.disconnects.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

pub struct MemoryFactory {
    pub fs: Arc<MemoryFs>,
    pub counters: Arc<Counters>,
    pub behaviour: Mutex<Behaviour>,
}

impl MemoryFactory {
    pub fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            fs: Arc::new(MemoryFs::default()),
            counters: Arc::new(Counters::default()),
            behaviour: Mutex::new(behaviour),
        })
    }

    pub fn set_behaviour(&self, update: impl FnOnce(&mut Behaviour)) {
        update(&mut self.behaviour.lock().unwrap());
    }
}

impl ClientFactory for MemoryFactory {
    fn create(&self, descriptor: &ConnectionDescriptor) -> Result<Box<dyn ProtocolClient>> {
        Ok(Box::new(MemoryClient {
            fs: Arc::clone(&self.fs),
            counters: Arc::clone(&self.counters),
            behaviour: self.behaviour.lock().unwrap().clone(),
            uri_base: descriptor.file_uri("/").trim_end_matches('/').to_string(),
            connected: false,
        }))
    }
}

pub fn access_with(behaviour: Behaviour) -> (StorageAccess, Arc<MemoryFactory>) {
    access_with_settings(behaviour, AccessSettings::default())
}

pub fn access_with_settings(behaviour: Behaviour, settings: AccessSettings) -> (StorageAccess, Arc<MemoryFactory>) {
    let factory = MemoryFactory::new(behaviour);
    let access = StorageAccess::with_factory(settings, factory.clone());
    (access, factory)
}

pub fn reaping_immediately() -> AccessSettings {
    AccessSettings {
        idle_timeout_secs: 0,
        ..AccessSettings::default()
    }
}

pub fn descriptor(host: &str) -> ConnectionDescriptor {
    ConnectionDescriptor::new(StorageType::Sftp, host)
}
