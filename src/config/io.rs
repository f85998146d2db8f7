//! Location, locking and (de)serialization of the config file.
//!
//! The file is opened once and kept open: the same descriptor backs the
//! single-instance lock, so reads and writes go through clones of it.

use std::env::current_exe;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::str;
use std::sync::Arc;
use directories_next::ProjectDirs;
use fd_lock::{RwLock, RwLockWriteGuard};
use log::{debug, info, warn};
use serde_json;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::config::types::Config;
use crate::error::ConfigError;

const CONFIG_FILE_NAME: &str = "sensor-link.json";

/// `<exe dir>/sensor-link.json`, used when it exists so a copy of the binary
/// can carry its own settings.
fn portable_config_path() -> Option<PathBuf> {
    let exe = match current_exe() {
        Ok(exe) => exe,
        Err(err) => {
            warn!("Failed to locate the executable: {:?}", err);
            return None;
        },
    };

    exe.parent().map(|dir| dir.join(CONFIG_FILE_NAME))
}

fn user_config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "sensor-link", "sensor-link")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

fn default_config_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = portable_config_path().filter(|path| path.is_file()) {
        debug!("Found portable config next to the executable");
        return Ok(path);
    }

    user_config_path().ok_or(ConfigError::NoConfigPath)
}

/// Exclusive lock on the config file, held for as long as a session runs.
pub struct ConfigIOLocker {
    rw_lock: RwLock<std::fs::File>,
}

impl ConfigIOLocker {
    /// Fails with [`ConfigError::CanNotLock`] when another process holds the lock.
    pub fn lock(&mut self) -> Result<RwLockWriteGuard<std::fs::File>, ConfigError> {
        self.rw_lock.try_write().map_err(|source| ConfigError::CanNotLock { source })
    }
}

#[derive(Clone)]
pub struct ConfigIO {
    file: Arc<std::fs::File>,
    path: PathBuf,
}

impl ConfigIO {
    /// Open (creating if needed) the config file at `path`, or at the default location.
    pub fn new_sync(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path,
            None => default_config_path()?,
        };
        info!("Using config file {}", path.to_string_lossy());

        if let Some(directory) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(directory)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        Ok(ConfigIO { file: Arc::new(file), path })
    }

    pub fn locker(&self) -> Result<ConfigIOLocker, ConfigError> {
        Ok(ConfigIOLocker { rw_lock: RwLock::new(self.file.try_clone()?) })
    }

    /// Directory holding the config file; the credential store lives next to it.
    pub fn directory(&self) -> PathBuf {
        self.path.parent().map(Path::to_path_buf).unwrap_or_default()
    }

    // shares the cursor with every other clone, so always rewind first
    async fn rewound(&self) -> Result<File, ConfigError> {
        let mut file = File::from_std(self.file.try_clone()?);
        file.rewind().await?;
        Ok(file)
    }

    /// An empty file (as freshly created) reads as the defaults.
    pub async fn read(&self) -> Result<Config, ConfigError> {
        let mut file = self.rewound().await?;
        let mut content = vec![];
        file.read_to_end(&mut content).await?;
        debug!("Read {} bytes of config", content.len());

        if content.is_empty() {
            return Ok(Config::default());
        }

        let content = str::from_utf8(&content)?;
        Ok(serde_json::from_str(content)?)
    }

    pub async fn save(&self, config: &Config) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(config)?;

        let mut file = self.rewound().await?;
        file.set_len(0).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        info!("Saved config to {}", self.path.to_string_lossy());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("sensor-link-config-{}", std::process::id()))
            .join(name)
    }

    #[tokio::test]
    async fn empty_file_reads_as_defaults_and_saves_round_trip() {
        let path = temp_path("roundtrip.json");
        let _ = std::fs::remove_file(&path);
        let config_io = ConfigIO::new_sync(Some(path.clone())).unwrap();

        assert_eq!(config_io.read().await.unwrap(), Config::default());

        let mut config = Config::default();
        config.device_name_marker = "scale".to_string();
        config.stream_diagnostics = true;
        config_io.save(&config).await.unwrap();

        assert_eq!(config_io.read().await.unwrap(), config);
        assert_eq!(config_io.directory(), path.parent().unwrap());
    }
}
