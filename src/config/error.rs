//! Configuration error types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Server group not found: {0}")]
    ServerNotFound(String),

    #[error("Link group {link_id} not found in server group {server_id}")]
    LinkNotFound { server_id: String, link_id: String },

    #[error("Duplicate server group id: {0}")]
    DuplicateServer(String),

    #[error("Duplicate link group id {link_id} in server group {server_id}")]
    DuplicateLink { server_id: String, link_id: String },

    #[error("Invalid server group {id}: {reason}")]
    InvalidServer { id: String, reason: String },

    #[error("Invalid link group {id}: {reason}")]
    InvalidLink { id: String, reason: String },

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}
