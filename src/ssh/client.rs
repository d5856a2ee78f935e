//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, PublicKeyBase64};
use russh::*;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::config::{AuthMethod, SshConfig};
use super::error::SshError;
use super::forward_registry::RemoteForwardRegistry;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use super::proxy::{dial, Socks5Proxy};
use crate::transport::InboundConnection;

/// An authenticated connection: the owner-task controller plus the routing
/// table for server-opened forwarded channels
pub struct SshConnection {
    pub controller: HandleController,
    pub forwards: Arc<RemoteForwardRegistry>,
}

pub struct SshClient {
    config: SshConfig,
    proxy: Option<Socks5Proxy>,
    probe_timeout: Duration,
}

impl SshClient {
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            proxy: None,
            probe_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_proxy(mut self, proxy: Option<Socks5Proxy>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    /// Connect and authenticate, then hand the handle to its owner task
    pub async fn connect(self) -> Result<SshConnection, SshError> {
        let addr = self.config.address();
        let deadline = Duration::from_secs(self.config.timeout_secs.max(1));

        match &self.proxy {
            Some(proxy) => info!(
                "Connecting to SSH server at {} via SOCKS5 {}:{}",
                addr, proxy.host, proxy.port
            ),
            None => info!("Connecting to SSH server at {}", addr),
        }

        // Liveness is probed by the transport keep-alive; russh's own keepalive
        // only catches connections the probe cannot reach
        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let forwards = RemoteForwardRegistry::new();
        let handler = ClientHandler::new(self.config.host.clone(), self.config.port, forwards.clone());

        let mut handle = tokio::time::timeout(deadline, async {
            let stream = dial(&self.config.host, self.config.port, self.proxy.as_ref(), deadline).await?;
            client::connect_stream(Arc::new(ssh_config), stream, handler).await
        })
        .await
        .map_err(|_| SshError::Timeout(format!("Connecting to {} timed out", addr)))??;

        debug!("SSH handshake completed with {}", addr);

        let authenticated = match &self.config.auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(&self.config.username, password)
                .await
                .map_err(|e| SshError::ConnectionFailed(format!("Authentication exchange failed: {}", e)))?,
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                    .map_err(|e| SshError::KeyError(format!("{}: {}", key_path, e)))?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

                handle
                    .authenticate_publickey(&self.config.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::ConnectionFailed(format!("Authentication exchange failed: {}", e)))?
            }
        };

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(format!(
                "Server {} rejected credentials for {}",
                addr, self.config.username
            )));
        }

        info!("SSH authentication successful for {}@{}", self.config.username, addr);

        let controller = spawn_handle_owner_task(handle, addr, self.probe_timeout);
        Ok(SshConnection {
            controller,
            forwards,
        })
    }
}

/// SHA256 fingerprint in OpenSSH notation
pub fn fingerprint(key: &PublicKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.public_key_bytes());
    format!("SHA256:{}", BASE64.encode(hasher.finalize()).trim_end_matches('='))
}

/// Client handler for russh callbacks
///
/// Host keys are accepted and their fingerprint logged. Server-opened
/// `forwarded-tcpip` channels are routed through the connection's
/// [`RemoteForwardRegistry`].
pub struct ClientHandler {
    host: String,
    port: u16,
    forwards: Arc<RemoteForwardRegistry>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, forwards: Arc<RemoteForwardRegistry>) -> Self {
        Self {
            host,
            port,
            forwards,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        info!(
            "Accepting host key for {}:{} ({})",
            self.host,
            self.port,
            fingerprint(server_public_key)
        );
        Ok(true)
    }

    /// Called when someone connects to a port the server listens on for us
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Server opened forwarded-tcpip channel: {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );

        let connection = InboundConnection {
            stream: Box::new(channel.into_stream()),
            originator: format!("{}:{}", originator_address, originator_port),
        };
        if !self
            .forwards
            .dispatch(connected_address, connected_port, connection)
        {
            warn!(
                "Dropped forwarded connection for {}:{}",
                connected_address, connected_port
            );
        }
        Ok(())
    }
}
