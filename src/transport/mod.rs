//! Transport Session abstraction
//!
//! A transport session is one authenticated connection to one server that
//! multiplexes many byte-stream channels. The session manager and the
//! forwarders only see the traits below; [`SshTransport`] is the russh-backed
//! implementation.

mod keepalive;
mod ssh_transport;

#[cfg(test)]
pub(crate) mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::ssh::{SshConfig, SshError};

pub use keepalive::{spawn_keepalive, HealthEvent, KeepaliveConfig};
pub use ssh_transport::{SshSession, SshTransport};

/// Bidirectional byte stream carried by a channel
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Shared handle to a live session
pub type SessionHandle = Arc<dyn TransportSession>;

/// What a channel is opened for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPurpose {
    /// Connect from the server side to `host:port`
    DirectTcpip { host: String, port: u16 },
}

/// A connection the server accepted on a remote listener
pub struct InboundConnection {
    pub stream: BoxedStream,
    /// `address:port` of the remote client, for logs
    pub originator: String,
}

/// Server-side listener requested with [`TransportSession::listen_remote`]
pub struct RemoteListener {
    /// Port the server actually bound
    pub bound_port: u16,
    /// Closed when the session goes away
    pub incoming: mpsc::Receiver<InboundConnection>,
}

/// Result of one liveness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    /// Probe failed, the connection may still recover
    Degraded,
    /// The connection is gone
    Closed,
}

#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Open an independent channel, safe to call concurrently
    async fn open_channel(&self, purpose: ChannelPurpose) -> Result<BoxedStream, SshError>;

    /// Ask the server to listen on `address:port`
    async fn listen_remote(&self, address: &str, port: u16) -> Result<RemoteListener, SshError>;

    /// Withdraw a listener created by `listen_remote`
    async fn cancel_remote(&self, address: &str, port: u16) -> Result<(), SshError>;

    async fn health_check(&self) -> ProbeOutcome;

    /// Resolves once the underlying connection is gone
    async fn closed(&self);

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Dial, handshake and authenticate
    async fn open(&self, config: &SshConfig) -> Result<SessionHandle, SshError>;
}
