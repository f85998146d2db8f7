use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use async_trait::async_trait;
use log::{debug, info};
use serde_json;

use crate::error::ConfigError;

pub const CREDENTIALS_FILE_NAME: &str = "credentials.json";

/// Flat deviceId -> credential map. Writes are per key; there is no
/// transaction spanning several keys.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, device_id: &str) -> Result<Option<String>, ConfigError>;

    async fn set(&self, device_id: &str, credential: &str) -> Result<(), ConfigError>;

    /// Every stored mapping, used to annotate scan results.
    async fn entries(&self) -> Result<HashMap<String, String>, ConfigError>;
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    credentials: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.credentials.lock().expect("Failed to lock credentials")
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, device_id: &str) -> Result<Option<String>, ConfigError> {
        Ok(self.lock().get(device_id).cloned())
    }

    async fn set(&self, device_id: &str, credential: &str) -> Result<(), ConfigError> {
        self.lock().insert(device_id.to_string(), credential.to_string());
        Ok(())
    }

    async fn entries(&self) -> Result<HashMap<String, String>, ConfigError> {
        Ok(self.lock().clone())
    }
}

/// Credentials persisted as a JSON object, rewritten as a whole on every change.
pub struct FileCredentialStore {
    path: PathBuf,
    // loaded lazily; the lock also serializes writers
    cache: tokio::sync::Mutex<Option<HashMap<String, String>>>,
}

impl FileCredentialStore {
    pub fn new(path: PathBuf) -> Self {
        FileCredentialStore {
            path,
            cache: tokio::sync::Mutex::new(None),
        }
    }

    async fn load(&self) -> Result<HashMap<String, String>, ConfigError> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(err) => {
                let err = ConfigError::from(err);
                if err.is_file_not_found_error() {
                    debug!("No credentials file at {}", self.path.to_string_lossy());
                    return Ok(HashMap::new());
                }
                return Err(err);
            },
        };

        if content.is_empty() {
            return Ok(HashMap::new());
        }

        let content = std::str::from_utf8(&content)?;
        Ok(serde_json::from_str(content)?)
    }

    async fn with_credentials<T>(&self, f: impl FnOnce(&mut HashMap<String, String>) -> T) -> Result<T, ConfigError> {
        let mut cache = self.cache.lock().await;
        if cache.is_none() {
            *cache = Some(self.load().await?);
        }

        match cache.as_mut() {
            Some(credentials) => Ok(f(credentials)),
            None => Ok(f(&mut HashMap::new())),
        }
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self, device_id: &str) -> Result<Option<String>, ConfigError> {
        self.with_credentials(|credentials| credentials.get(device_id).cloned()).await
    }

    async fn set(&self, device_id: &str, credential: &str) -> Result<(), ConfigError> {
        let mut cache = self.cache.lock().await;
        let mut credentials = match cache.take() {
            Some(credentials) => credentials,
            None => self.load().await?,
        };
        credentials.insert(device_id.to_string(), credential.to_string());

        let content = serde_json::to_string_pretty(&credentials)?;
        *cache = Some(credentials);

        if let Some(directory) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(directory).await?;
        }

        // write next to the target and rename, so a crash never leaves half a file
        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, content.as_bytes()).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;

        info!("Stored credential for {}", device_id);
        Ok(())
    }

    async fn entries(&self) -> Result<HashMap<String, String>, ConfigError> {
        self.with_credentials(|credentials| credentials.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("sensor-link-credentials-{}", std::process::id()))
            .join(name)
    }

    #[tokio::test]
    async fn memory_store_overwrites() {
        let store = MemoryCredentialStore::new();
        assert_eq!(store.get("X").await.unwrap(), None);

        store.set("X", "1234").await.unwrap();
        store.set("X", "5678").await.unwrap();

        assert_eq!(store.get("X").await.unwrap().as_deref(), Some("5678"));
        assert_eq!(store.entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_store_persists_across_instances() {
        let path = temp_path("persist.json");
        let _ = std::fs::remove_file(&path);

        let store = FileCredentialStore::new(path.clone());
        assert!(store.entries().await.unwrap().is_empty());
        store.set("AA:BB", "1234").await.unwrap();
        store.set("CC:DD", "abcd").await.unwrap();

        let reopened = FileCredentialStore::new(path);
        assert_eq!(reopened.get("AA:BB").await.unwrap().as_deref(), Some("1234"));
        assert_eq!(reopened.entries().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let path = temp_path("corrupt.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not json").unwrap();

        let store = FileCredentialStore::new(path);
        assert!(matches!(store.entries().await, Err(ConfigError::JsonError { .. })));
    }
}
