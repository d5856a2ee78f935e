//! Configuration Storage
//!
//! Handles reading/writing the configuration file to disk.
//! Config location: ~/.relaykeep on macOS/Linux, %APPDATA%\RelayKeep on Windows

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use zeroize::Zeroizing;

use super::seal::{self, SealError};
use super::types::{Config, CONFIG_VERSION};

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },

    #[error("Config file is sealed but no passphrase was provided")]
    PassphraseRequired,

    #[error(transparent)]
    Seal(#[from] SealError),
}

/// `%APPDATA%\RelayKeep` on Windows, `~/.relaykeep` elsewhere
pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("RelayKeep"));
        }
    }

    dirs::home_dir()
        .map(|home| home.join(".relaykeep"))
        .ok_or(StorageError::NoConfigDir)
}

/// Get the default configuration file path
pub fn config_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("config.json"))
}

/// Configuration storage manager
pub struct ConfigStorage {
    path: PathBuf,
    passphrase: Option<Zeroizing<String>>,
}

impl ConfigStorage {
    /// Create a new storage manager with default path
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self::with_path(config_file()?))
    }

    /// Create storage manager with custom path
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            passphrase: None,
        }
    }

    /// Read and write the sealed form using this passphrase
    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(Zeroizing::new(passphrase.into()));
        self
    }

    pub fn is_sealing(&self) -> bool {
        self.passphrase.is_some()
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }

    /// Read the file, unsealing it if needed. A missing file yields the
    /// default config; unparseable JSON is backed up and replaced by defaults.
    pub async fn load(&self) -> Result<Config, StorageError> {
        match self.load_strict().await {
            Err(StorageError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Config::default())
            }
            Err(StorageError::Json(e)) => {
                tracing::warn!("Cannot parse {:?}: {}", self.path, e);

                match self.backup().await {
                    Ok(backup_path) => {
                        tracing::warn!("Moved aside to {:?}, starting empty", backup_path)
                    }
                    Err(backup_err) => tracing::error!("Backup failed: {}", backup_err),
                }

                Ok(Config::default())
            }
            other => other,
        }
    }

    /// Like [`load`](Self::load), but every problem with the file is an error
    /// and nothing on disk is touched
    pub async fn load_strict(&self) -> Result<Config, StorageError> {
        let contents = fs::read_to_string(&self.path).await?;
        let json = self.decode(contents)?;

        let config: Config = serde_json::from_str(&json)?;
        if config.version > CONFIG_VERSION {
            return Err(StorageError::VersionTooNew {
                found: config.version,
                supported: CONFIG_VERSION,
            });
        }
        Ok(config)
    }

    /// File contents to JSON text. A wrong passphrase is an error, never a
    /// reason to discard the file.
    fn decode(&self, contents: String) -> Result<Zeroizing<String>, StorageError> {
        let plain = if seal::is_sealed(&contents) {
            let passphrase = self
                .passphrase
                .as_ref()
                .ok_or(StorageError::PassphraseRequired)?;
            seal::unseal(&contents, passphrase)?
        } else if seal::is_legacy(&contents) {
            tracing::info!(
                "{:?} uses the legacy encrypted format, it is rewritten on the next save",
                self.path
            );
            seal::unseal_legacy(&contents)?
        } else {
            return Ok(Zeroizing::new(contents));
        };
        Ok(Zeroizing::new(String::from_utf8_lossy(&plain).into_owned()))
    }

    /// Write through a temp file and rename, sealing when a passphrase is set
    pub async fn save(&self, config: &Config) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        let json = Zeroizing::new(serde_json::to_string_pretty(config)?);
        let contents = match &self.passphrase {
            Some(passphrase) => seal::seal(json.as_bytes(), passphrase)?,
            None => json.to_string(),
        };

        let temp_path = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;

        tracing::debug!("Config saved to {:?}", self.path);
        Ok(())
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy the current file aside under a timestamped name
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));

        if self.exists().await {
            fs::copy(&self.path, &backup_path).await?;
        }

        Ok(backup_path)
    }
}
