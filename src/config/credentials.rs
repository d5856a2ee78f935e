//! Credential Store
//!
//! Turns a server group's auth material into an [`SshConfig`]. A configured
//! private key wins over the password, in which case the password field is
//! used as the key passphrase.

use std::path::{Path, PathBuf};

use thiserror::Error;

use super::settings::Settings;
use super::types::ServerGroup;
use crate::ssh::{AuthMethod, SshConfig};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("Server group {0} has no username")]
    MissingUsername(String),

    #[error("Server group {0} has neither a password nor a private key")]
    MissingSecret(String),

    #[error("Private key not found: {0}")]
    KeyNotFound(String),
}

#[derive(Debug, Clone, Default)]
pub struct CredentialResolver {
    home: Option<PathBuf>,
}

impl CredentialResolver {
    /// Resolver that expands `~` against the current user's home directory
    pub fn new() -> Self {
        Self {
            home: dirs::home_dir(),
        }
    }

    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: Some(home.into()),
        }
    }

    fn expand(&self, path: &str) -> PathBuf {
        match (path.strip_prefix("~/"), &self.home) {
            (Some(rest), Some(home)) => home.join(rest),
            _ => PathBuf::from(path),
        }
    }

    /// Build the connection descriptor for `server`
    pub fn resolve(
        &self,
        server: &ServerGroup,
        settings: &Settings,
    ) -> Result<SshConfig, CredentialError> {
        if server.username.trim().is_empty() {
            return Err(CredentialError::MissingUsername(server.id.clone()));
        }

        let auth = match server.private_key_path.as_deref().map(str::trim) {
            Some(key_path) if !key_path.is_empty() => {
                let key_path = self.expand(key_path);
                if !Path::new(&key_path).is_file() {
                    return Err(CredentialError::KeyNotFound(
                        key_path.display().to_string(),
                    ));
                }
                AuthMethod::Key {
                    key_path: key_path.to_string_lossy().into_owned(),
                    passphrase: (!server.password.is_empty()).then(|| server.password.clone()),
                }
            }
            _ if !server.password.is_empty() => AuthMethod::Password {
                password: server.password.clone(),
            },
            _ => return Err(CredentialError::MissingSecret(server.id.clone())),
        };

        Ok(SshConfig {
            host: server.server_host.trim().to_string(),
            port: server.server_port,
            username: server.username.clone(),
            auth,
            timeout_secs: settings.connect_timeout_secs.max(1),
        })
    }
}
