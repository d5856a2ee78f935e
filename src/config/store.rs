//! Config Store
//!
//! Owns the durable configuration: an arena read model backed by
//! [`ConfigStorage`]. Every accepted intent is persisted before it is returned
//! to the caller, who then forwards the normalized intent to the session manager.

use thiserror::Error;
use tracing::info;

use super::arena::ConfigArena;
use super::error::ConfigError;
use super::intent::Intent;
use super::storage::{ConfigStorage, StorageError};
use super::types::Config;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct ConfigStore {
    arena: ConfigArena,
    storage: ConfigStorage,
}

impl ConfigStore {
    /// Load the configuration from `storage`
    pub async fn open(storage: ConfigStorage) -> Result<Self, StoreError> {
        let config = storage.load().await?;
        let arena = ConfigArena::from_config(&config)?;
        info!(
            "Loaded {} server group(s) from {:?}",
            arena.len(),
            storage.path()
        );
        Ok(Self { arena, storage })
    }

    pub fn arena(&self) -> &ConfigArena {
        &self.arena
    }

    pub fn snapshot(&self) -> Config {
        self.arena.to_config()
    }

    pub fn storage(&self) -> &ConfigStorage {
        &self.storage
    }

    /// Apply and persist an intent, returning it with ids assigned
    pub async fn apply(&mut self, mut intent: Intent) -> Result<Intent, StoreError> {
        intent.normalize();

        let mut next = self.arena.clone();
        next.apply(&intent)?;
        self.storage.save(&next.to_config()).await?;
        self.arena = next;

        Ok(intent)
    }

    /// Re-read the file and return the snapshot as a replacement intent.
    /// An unreadable or half-written file is an error and the current
    /// configuration stays in place.
    pub async fn reload(&mut self) -> Result<Intent, StoreError> {
        let config = self.storage.load_strict().await?;
        let mut intent = Intent::Replace { config };
        intent.normalize();
        self.arena.apply(&intent)?;
        info!("Reloaded {} server group(s)", self.arena.len());
        Ok(intent)
    }
}
