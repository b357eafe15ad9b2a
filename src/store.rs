//! Key/value persistence for the device configuration.
//!
//! Only [`DeviceConfig`](crate::device_config::DeviceConfig) goes through this
//! store. Graph contents and notifications are rebuilt after every restart.

use std::{
    collections::{BTreeMap, HashMap},
    fs, io,
    path::{Path, PathBuf},
};

use log::{debug, info};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("store contents are corrupt: {0}")]
    Corrupt(String),
}

/// Capability trait for persistent string settings.
#[cfg_attr(test, mockall::automock)]
pub trait ConfigStore: Send {
    /// Returns the stored value for `key`, or `default` when it is absent.
    fn load(&self, key: &str, default: &str) -> Result<String, StoreError>;

    fn save(&mut self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Stores several keys at once. Stores that can write them atomically
    /// should override this.
    fn save_all(&mut self, values: &BTreeMap<String, String>) -> Result<(), StoreError> {
        for (key, value) in values {
            self.save(key, value)?;
        }
        Ok(())
    }

    /// Removes every stored key.
    fn clear(&mut self) -> Result<(), StoreError>;
}

/// Flat YAML map on disk.
///
/// The file is re-read on every [`load`](ConfigStore::load) so edits made by
/// the setup UI are picked up without restarting. Writes go through a
/// temporary file and a rename.
#[derive(Debug, Clone)]
pub struct YamlFileStore {
    path: PathBuf,
}

impl YamlFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };

        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        serde_yaml::from_str(&content)
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", self.path.display())))
    }

    fn write_all(&self, values: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let yaml = serde_yaml::to_string(values)
            .map_err(|e| StoreError::Corrupt(format!("serialize: {e}")))?;

        let tmp_path = self.path.with_extension("yml.tmp");
        fs::write(&tmp_path, yaml)?;
        fs::rename(&tmp_path, &self.path)?;

        debug!("Device store written to {}", self.path.display());
        Ok(())
    }
}

impl ConfigStore for YamlFileStore {
    fn load(&self, key: &str, default: &str) -> Result<String, StoreError> {
        Ok(self
            .read_all()?
            .remove(key)
            .unwrap_or_else(|| default.to_string()))
    }

    fn save(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self.read_all()?;
        values.insert(key.to_string(), value.to_string());
        self.write_all(&values)
    }

    /// One read and one rename for the whole batch.
    fn save_all(&mut self, values: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let mut stored = self.read_all()?;
        stored.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.write_all(&stored)
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Device store {} cleared", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store for hosts without persistent storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryStore {
    fn load(&self, key: &str, default: &str) -> Result<String, StoreError> {
        Ok(self
            .values
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string()))
    }

    fn save(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        self.values.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn yaml_store_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let store = YamlFileStore::new(dir.path().join("device.yml"));

        assert_eq!(store.load("wifi_ssid", "fallback").unwrap(), "fallback");
    }

    #[test]
    fn yaml_store_save_then_load() {
        let dir = TempDir::new().unwrap();
        let mut store = YamlFileStore::new(dir.path().join("nested/device.yml"));

        store.save("github_username", "octocat").unwrap();
        store.save("repositories", "octocat/hello").unwrap();

        let reopened = YamlFileStore::new(store.path().to_path_buf());
        assert_eq!(reopened.load("github_username", "").unwrap(), "octocat");
        assert_eq!(reopened.load("repositories", "").unwrap(), "octocat/hello");
        assert!(!store.path().with_extension("yml.tmp").exists());
    }

    #[test]
    fn yaml_store_batch_write_keeps_other_keys() {
        let dir = TempDir::new().unwrap();
        let mut store = YamlFileStore::new(dir.path().join("device.yml"));
        store.save("setup_ssid", "GitGlow-Setup").unwrap();

        let batch = BTreeMap::from([
            ("wifi_ssid".to_string(), "home".to_string()),
            ("github_username".to_string(), "octocat".to_string()),
        ]);
        store.save_all(&batch).unwrap();

        assert_eq!(store.load("wifi_ssid", "").unwrap(), "home");
        assert_eq!(store.load("github_username", "").unwrap(), "octocat");
        assert_eq!(store.load("setup_ssid", "").unwrap(), "GitGlow-Setup");
        assert!(!store.path().with_extension("yml.tmp").exists());
    }

    #[test]
    fn yaml_store_batch_write_fails_as_a_whole() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("device.yml");
        fs::write(&path, "- not\n- a map\n").unwrap();
        let mut store = YamlFileStore::new(&path);

        let batch = BTreeMap::from([("wifi_ssid".to_string(), "home".to_string())]);
        assert!(matches!(store.save_all(&batch), Err(StoreError::Corrupt(_))));
        assert_eq!(fs::read_to_string(&path).unwrap(), "- not\n- a map\n");
    }

    #[test]
    fn yaml_store_unparseable_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("device.yml");
        fs::write(&path, "- not\n- a map\n").unwrap();

        let store = YamlFileStore::new(&path);
        let result = store.load("wifi_ssid", "");
        assert!(matches!(result, Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn yaml_store_clear_removes_file_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut store = YamlFileStore::new(dir.path().join("device.yml"));
        store.save("wifi_ssid", "home").unwrap();

        store.clear().unwrap();
        assert!(!store.path().exists());
        store.clear().unwrap();
        assert_eq!(store.load("wifi_ssid", "none").unwrap(), "none");
    }

    #[test]
    fn memory_store_roundtrip_and_clear() {
        let mut store = MemoryStore::new();
        store.save("led_brightness", "64").unwrap();
        assert_eq!(store.load("led_brightness", "128").unwrap(), "64");

        store.clear().unwrap();
        assert_eq!(store.load("led_brightness", "128").unwrap(), "128");
    }
}
