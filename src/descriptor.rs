use crate::error::{Result, StorageError};
use crate::utils::normalize_path;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Smb,
    Ftp,
    Sftp,
    WebDav,
    WebDavs,
}

impl StorageType {
    pub fn default_port(self) -> u16 {
        match self {
            Self::Smb => 445,
            Self::Ftp => 21,
            Self::Sftp => 22,
            Self::WebDav => 80,
            Self::WebDavs => 443,
        }
    }

    pub fn scheme(self) -> &'static str {
        match self {
            Self::Smb => "smb",
            Self::Ftp => "ftp",
            Self::Sftp => "sftp",
            Self::WebDav => "http",
            Self::WebDavs => "https",
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Smb => "SMB",
            Self::Ftp => "FTP",
            Self::Sftp => "SFTP",
            Self::WebDav => "WebDAV",
            Self::WebDavs => "WebDAV (HTTPS)",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDescriptor {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub storage: StorageType,
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub anonymous: bool,
    #[serde(default)]
    pub enable_dfs: bool,
    #[serde(default)]
    pub extension: bool,
    #[serde(default)]
    pub safe_transfer: bool,
}

impl ConnectionDescriptor {
    pub const NEW_ID: &'static str = "";

    pub fn new(storage: StorageType, host: impl Into<String>) -> Self {
        let host = host.into();
        Self {
            name: host.clone(),
            storage,
            host,
            ..Self::default()
        }
    }

    pub fn create_from_host(host: impl Into<String>) -> Self {
        Self::new(StorageType::Smb, host)
    }

    pub fn is_new(&self) -> bool {
        self.id == Self::NEW_ID
    }

    /// Canonical form: blank optionals dropped, anonymous credentials cleared.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        fn blank_to_none(value: Option<String>) -> Option<String> {
            value.filter(|v| !v.trim().is_empty())
        }

        self.host = self.host.trim().to_string();
        if self.name.trim().is_empty() {
            self.name = self.host.clone();
        }
        self.domain = blank_to_none(self.domain);
        self.folder = blank_to_none(self.folder);
        if self.anonymous {
            self.user = None;
            self.password = None;
        } else {
            self.user = blank_to_none(self.user);
            self.password = blank_to_none(self.password);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(StorageError::InvalidDescriptor("host is empty".into()));
        }
        if self.anonymous && (self.user.is_some() || self.password.is_some()) {
            return Err(StorageError::InvalidDescriptor(
                "anonymous connections cannot carry credentials".into(),
            ));
        }
        Ok(())
    }

    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.storage.default_port())
    }

    pub fn root_folder(&self) -> String {
        normalize_path(self.folder.as_deref().unwrap_or("/"))
    }

    fn authority(&self) -> String {
        match self.port {
            Some(port) if port != self.storage.default_port() => format!("{}:{}", self.host, port),
            _ => self.host.clone(),
        }
    }

    pub fn uri(&self) -> String {
        let root = self.root_folder();
        if root == "/" {
            format!("{}://{}/", self.storage.scheme(), self.authority())
        } else {
            format!("{}://{}{}/", self.storage.scheme(), self.authority(), root)
        }
    }

    pub fn file_uri(&self, path: &str) -> String {
        format!("{}://{}{}", self.storage.scheme(), self.authority(), normalize_path(path))
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("storage", &self.storage)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("domain", &self.domain)
            .field("folder", &self.folder)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("anonymous", &self.anonymous)
            .field("enable_dfs", &self.enable_dfs)
            .field("extension", &self.extension)
            .field("safe_transfer", &self.safe_transfer)
            .finish()
    }
}
