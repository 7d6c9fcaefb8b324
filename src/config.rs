use crate::descriptor::ConnectionDescriptor;
use crate::settings::AccessSettings;
use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub settings: AccessSettings,
    #[serde(default)]
    pub connections: Vec<ConnectionDescriptor>,
}

impl AppConfig {
    pub fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "sharefs", "sharefs")
            .map(|dirs| dirs.config_dir().join("config.json"))
    }

    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        match Self::config_path() {
            Some(path) => self.save_to(&path),
            None => bail!("no configuration directory available"),
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn find(&self, key: &str) -> Option<&ConnectionDescriptor> {
        self.connections
            .iter()
            .find(|c| c.id == key)
            .or_else(|| self.connections.iter().find(|c| c.name == key))
    }

    pub fn upsert(&mut self, descriptor: ConnectionDescriptor) -> Result<String> {
        let mut descriptor = descriptor.normalized();
        descriptor.validate()?;

        let uri = descriptor.uri();
        if let Some(clash) = self
            .connections
            .iter()
            .find(|c| c.id != descriptor.id && c.uri() == uri)
        {
            bail!("connection '{}' already uses {}", clash.name, uri);
        }

        if descriptor.is_new() {
            descriptor.id = self.next_id();
            let id = descriptor.id.clone();
            self.connections.push(descriptor);
            return Ok(id);
        }

        let id = descriptor.id.clone();
        match self.connections.iter_mut().find(|c| c.id == id) {
            Some(existing) => *existing = descriptor,
            None => self.connections.push(descriptor),
        }
        Ok(id)
    }

    pub fn remove(&mut self, key: &str) -> Option<ConnectionDescriptor> {
        let id = self.find(key)?.id.clone();
        let index = self.connections.iter().position(|c| c.id == id)?;
        Some(self.connections.remove(index))
    }

    fn next_id(&self) -> String {
        let highest = self
            .connections
            .iter()
            .filter_map(|c| c.id.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        (highest + 1).to_string()
    }
}

pub fn ensure_password(descriptor: &mut ConnectionDescriptor) -> Result<()> {
    if descriptor.anonymous || descriptor.user.is_none() || descriptor.password.is_some() {
        return Ok(());
    }
    let prompt = format!(
        "Password for {}@{}: ",
        descriptor.user.as_deref().unwrap_or_default(),
        descriptor.host
    );
    let password = rpassword::prompt_password(prompt).context("reading password")?;
    descriptor.password = Some(password).filter(|p| !p.is_empty());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::StorageType;
    use pretty_assertions::assert_eq;

    fn smb(host: &str, folder: &str) -> ConnectionDescriptor {
        let mut descriptor = ConnectionDescriptor::new(StorageType::Smb, host);
        descriptor.folder = Some(folder.to_string());
        descriptor.user = Some("alice".to_string());
        descriptor.password = Some("secret".to_string());
        descriptor
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.connections.is_empty());
        assert_eq!(config.settings, AccessSettings::default());
    }

    #[test]
    fn test_upsert_assigns_ids_and_rejects_duplicate_uri() {
        let mut config = AppConfig::default();
        assert_eq!(config.upsert(smb("nas", "/share")).unwrap(), "1");
        assert_eq!(config.upsert(smb("nas", "/other")).unwrap(), "2");

        let err = config.upsert(smb("nas", "share/")).unwrap_err();
        assert!(err.to_string().contains("already uses"));
        assert_eq!(config.connections.len(), 2);
    }

    #[test]
    fn test_upsert_replaces_existing_connection() {
        let mut config = AppConfig::default();
        let id = config.upsert(smb("nas", "/share")).unwrap();

        let mut edited = config.find(&id).unwrap().clone();
        edited.safe_transfer = true;
        assert_eq!(config.upsert(edited).unwrap(), id);

        assert_eq!(config.connections.len(), 1);
        assert!(config.connections[0].safe_transfer);
    }

    #[test]
    fn test_save_and_load_skip_passwords() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = AppConfig::default();
        config.settings.cache_ttl_secs = 5;
        config.upsert(smb("nas", "/share")).unwrap();
        config.save_to(&path).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("secret"));

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.settings.cache_ttl_secs, 5);
        assert_eq!(loaded.connections.len(), 1);
        assert_eq!(loaded.connections[0].password, None);
        assert_eq!(loaded.find("nas").map(|c| c.id.as_str()), Some("1"));
    }

    #[test]
    fn test_missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(&dir.path().join("absent.json")).unwrap();
        assert!(config.connections.is_empty());
    }

    #[test]
    fn test_remove_by_name() {
        let mut config = AppConfig::default();
        config.upsert(smb("nas", "/share")).unwrap();
        let removed = config.remove("nas").unwrap();
        assert_eq!(removed.host, "nas");
        assert!(config.connections.is_empty());
        assert!(config.remove("nas").is_none());
    }

    #[test]
    fn test_anonymous_never_prompts() {
        let mut descriptor = ConnectionDescriptor::new(StorageType::Ftp, "ftp.local");
        descriptor.anonymous = true;
        ensure_password(&mut descriptor).unwrap();
        assert_eq!(descriptor.password, None);
    }
}
