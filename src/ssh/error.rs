//! SSH Error types

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Disconnected")]
    Disconnected,
}

/// Failure classes that decide how a failure propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad credentials, needs user action
    Auth,
    /// Dial or handshake failure, retried with backoff
    Network,
    /// Mid-session channel open failure, retried by the forwarder
    Channel,
    /// Local or remote listen failure, waits for a configuration change
    Bind,
}

impl SshError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SshError::AuthenticationFailed(_) | SshError::KeyError(_) => ErrorKind::Auth,
            SshError::ChannelError(_) => ErrorKind::Channel,
            SshError::BindFailed(_) => ErrorKind::Bind,
            SshError::ConnectionFailed(_)
            | SshError::Proxy(_)
            | SshError::IoError(_)
            | SshError::ProtocolError(_)
            | SshError::Timeout(_)
            | SshError::Disconnected => ErrorKind::Network,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::Channel)
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

impl Serialize for SshError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            SshError::AuthenticationFailed("rejected".into()).kind(),
            ErrorKind::Auth
        );
        assert!(!SshError::AuthenticationFailed("rejected".into()).is_retryable());
        assert!(SshError::Timeout("dial".into()).is_retryable());
        assert_eq!(
            SshError::from(std::io::Error::from(std::io::ErrorKind::ConnectionRefused)).kind(),
            ErrorKind::Network
        );
        assert!(!SshError::BindFailed("in use".into()).is_retryable());
        assert_eq!(SshError::ChannelError("denied".into()).kind(), ErrorKind::Channel);
    }
}
