pub mod smb;
pub mod stream;
pub mod vfs;

use crate::descriptor::{ConnectionDescriptor, StorageType};
use crate::error::Result;
use crate::settings::AccessSettings;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub use stream::{ChunkSender, ReadStream, UploadSource, WriteStream};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub uri: String,
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
    pub is_directory: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub random_access_read: bool,
    /// `rename` with `replace` swaps the destination in one step.
    pub atomic_replace: bool,
    pub append: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectInfo {
    pub resolved_root: Option<String>,
    pub dfs_fallback: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Truncate,
    Append,
}

/// One protocol family behind a uniform contract. Paths are absolute within
/// the server, in `/a/b` form.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    async fn connect(&mut self) -> Result<ConnectInfo>;
    async fn is_alive(&mut self) -> bool;
    async fn list(&mut self, path: &str) -> Result<Vec<FileEntry>>;
    async fn stat(&mut self, path: &str) -> Result<FileEntry>;
    async fn open_read(&mut self, path: &str, offset: u64) -> Result<ReadStream>;
    async fn open_write(&mut self, path: &str, mode: WriteMode) -> Result<WriteStream>;
    async fn create(&mut self, path: &str, is_directory: bool) -> Result<FileEntry>;
    async fn delete(&mut self, path: &str) -> Result<()>;
    async fn rename(&mut self, from: &str, to: &str, replace: bool) -> Result<()>;
    async fn disconnect(&mut self) -> Result<()>;
}

pub trait ClientFactory: Send + Sync {
    fn create(&self, descriptor: &ConnectionDescriptor) -> Result<Box<dyn ProtocolClient>>;
}

pub struct DefaultClientFactory {
    settings: AccessSettings,
}

impl DefaultClientFactory {
    pub fn new(settings: AccessSettings) -> Self {
        Self { settings }
    }
}

impl ClientFactory for DefaultClientFactory {
    fn create(&self, descriptor: &ConnectionDescriptor) -> Result<Box<dyn ProtocolClient>> {
        descriptor.validate()?;
        let descriptor = descriptor.clone();
        let timeout = self.settings.connect_timeout();
        let client: Box<dyn ProtocolClient> = match descriptor.storage {
            StorageType::Smb => Box::new(smb::SmbClient::new(
                descriptor,
                self.settings.smbclient_path.clone(),
                timeout,
            )),
            StorageType::Ftp => {
                let provider = vfs::ftp::FtpProvider::new(&descriptor, timeout);
                Box::new(vfs::VfsClient::new(descriptor, provider))
            }
            StorageType::Sftp => {
                let provider = vfs::sftp::SftpProvider::new(&descriptor, timeout);
                Box::new(vfs::VfsClient::new(descriptor, provider))
            }
            StorageType::WebDav | StorageType::WebDavs => {
                let provider = vfs::webdav::WebDavProvider::new(&descriptor, timeout)?;
                Box::new(vfs::VfsClient::new(descriptor, provider))
            }
        };
        Ok(client)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use mockall::mock;

    mock! {
        pub Client {}

        #[async_trait]
        impl ProtocolClient for Client {
            fn capabilities(&self) -> Capabilities;
            async fn connect(&mut self) -> Result<ConnectInfo>;
            async fn is_alive(&mut self) -> bool;
            async fn list(&mut self, path: &str) -> Result<Vec<FileEntry>>;
            async fn stat(&mut self, path: &str) -> Result<FileEntry>;
            async fn open_read(&mut self, path: &str, offset: u64) -> Result<ReadStream>;
            async fn open_write(&mut self, path: &str, mode: WriteMode) -> Result<WriteStream>;
            async fn create(&mut self, path: &str, is_directory: bool) -> Result<FileEntry>;
            async fn delete(&mut self, path: &str) -> Result<()>;
            async fn rename(&mut self, from: &str, to: &str, replace: bool) -> Result<()>;
            async fn disconnect(&mut self) -> Result<()>;
        }
    }
}
