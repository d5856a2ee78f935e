//! Configuration Management Module
//!
//! Persisted server/link tree, its id-indexed read model, the intents that
//! mutate it, on-disk storage (plain or sealed) and credential resolution.

pub mod arena;
pub mod credentials;
mod error;
pub mod intent;
pub mod seal;
mod settings;
pub mod storage;
pub mod store;
pub mod types;

pub use arena::{ConfigArena, ServerRecord};
pub use credentials::{CredentialError, CredentialResolver};
pub use error::ConfigError;
pub use intent::Intent;
pub use settings::Settings;
pub use storage::{config_dir, config_file, ConfigStorage, StorageError};
pub use store::{ConfigStore, StoreError};
pub use types::{Config, LinkGroup, ServerGroup, CONFIG_VERSION};
