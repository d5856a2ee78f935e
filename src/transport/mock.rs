//! In-process transport for tests
//!
//! Servers are keyed by host name. Direct channels dial real TCP targets,
//! optionally through a route table, and remote listeners are fed by
//! [`MockServer::connect_remote`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    BoxedStream, ChannelPurpose, InboundConnection, ProbeOutcome, RemoteListener, SessionHandle,
    Transport, TransportSession,
};
use crate::ssh::{AuthMethod, SshConfig, SshError};

/// TCP echo server on a free loopback port
pub(crate) async fn echo_server() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind echo server");
    let addr = listener.local_addr().expect("echo server address");
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = socket.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    servers: Arc<Mutex<HashMap<String, Arc<MockServer>>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(host: &str) -> SshConfig {
        SshConfig {
            host: host.to_string(),
            port: 22,
            username: "root".to_string(),
            auth: AuthMethod::Password {
                password: "secret".to_string(),
            },
            timeout_secs: 5,
        }
    }

    pub fn server(&self, host: &str) -> Arc<MockServer> {
        self.servers
            .lock()
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(MockServer::default()))
            .clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, config: &SshConfig) -> Result<SessionHandle, SshError> {
        let server = self.server(&config.host);
        server.attempts.fetch_add(1, Ordering::SeqCst);

        if server.unreachable.load(Ordering::SeqCst) {
            return Err(SshError::ConnectionFailed(format!(
                "{}: connection refused",
                config.address()
            )));
        }
        if server.reject_auth.load(Ordering::SeqCst) {
            return Err(SshError::AuthenticationFailed(format!(
                "{} rejected {}",
                config.address(),
                config.username
            )));
        }

        let session = Arc::new(MockSession {
            server: server.clone(),
            killed: CancellationToken::new(),
            listeners: Mutex::new(Vec::new()),
        });
        server.sessions.lock().push(session.clone());
        server.connects.fetch_add(1, Ordering::SeqCst);
        Ok(session)
    }
}

pub(crate) struct MockServer {
    reject_auth: AtomicBool,
    unreachable: AtomicBool,
    probe_failing: AtomicBool,
    refuse_channels: AtomicBool,
    refused_listen_ports: Mutex<Vec<u16>>,
    attempts: AtomicU32,
    connects: AtomicU32,
    next_port: AtomicU16,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    routes: Mutex<HashMap<(String, u16), SocketAddr>>,
    listeners: Mutex<HashMap<(String, u16), mpsc::Sender<InboundConnection>>>,
}

impl Default for MockServer {
    fn default() -> Self {
        Self {
            reject_auth: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
            probe_failing: AtomicBool::new(false),
            refuse_channels: AtomicBool::new(false),
            refused_listen_ports: Mutex::new(Vec::new()),
            attempts: AtomicU32::new(0),
            connects: AtomicU32::new(0),
            next_port: AtomicU16::new(40000),
            sessions: Mutex::new(Vec::new()),
            routes: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
        }
    }
}

impl MockServer {
    pub fn set_reject_auth(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_probe_failing(&self, failing: bool) {
        self.probe_failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_refuse_channels(&self, refuse: bool) {
        self.refuse_channels.store(refuse, Ordering::SeqCst);
    }

    pub fn refuse_listen(&self, port: u16) {
        self.refused_listen_ports.lock().push(port);
    }

    /// Send direct channels for `host:port` to a real address
    pub fn route(&self, host: &str, port: u16, target: SocketAddr) {
        self.routes.lock().insert((host.to_string(), port), target);
    }

    /// Drop every live session as if the network went away
    pub fn kill_sessions(&self) {
        let sessions: Vec<_> = self.sessions.lock().drain(..).collect();
        for session in sessions {
            session.shutdown();
        }
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions
            .lock()
            .iter()
            .filter(|s| !s.killed.is_cancelled())
            .count()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn has_listener(&self, address: &str, port: u16) -> bool {
        self.listeners
            .lock()
            .contains_key(&(address.to_string(), port))
    }

    /// Simulate a client connecting to a remote listener. Returns the
    /// client's end of the stream, or `None` when nothing listens there.
    pub async fn connect_remote(&self, address: &str, port: u16) -> Option<DuplexStream> {
        let sender = self
            .listeners
            .lock()
            .get(&(address.to_string(), port))
            .cloned()?;
        let (client, server_side) = tokio::io::duplex(16 * 1024);
        let inbound = InboundConnection {
            stream: Box::new(server_side),
            originator: "203.0.113.7:50000".to_string(),
        };
        sender.send(inbound).await.ok()?;
        Some(client)
    }
}

pub(crate) struct MockSession {
    server: Arc<MockServer>,
    killed: CancellationToken,
    listeners: Mutex<Vec<(String, u16)>>,
}

impl MockSession {
    fn shutdown(&self) {
        self.killed.cancel();
        let owned: Vec<_> = self.listeners.lock().drain(..).collect();
        let mut listeners = self.server.listeners.lock();
        for key in owned {
            listeners.remove(&key);
        }
    }

    fn ensure_alive(&self) -> Result<(), SshError> {
        if self.killed.is_cancelled() {
            Err(SshError::Disconnected)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TransportSession for MockSession {
    async fn open_channel(&self, purpose: ChannelPurpose) -> Result<BoxedStream, SshError> {
        self.ensure_alive()?;
        if self.server.refuse_channels.load(Ordering::SeqCst) {
            return Err(SshError::ChannelError("administratively prohibited".into()));
        }

        let ChannelPurpose::DirectTcpip { host, port } = purpose;
        let routed = self.server.routes.lock().get(&(host.clone(), port)).copied();
        let stream = match routed {
            Some(addr) => TcpStream::connect(addr).await,
            None => TcpStream::connect((host.as_str(), port)).await,
        }
        .map_err(|e| SshError::ChannelError(format!("connect to {}:{} failed: {}", host, port, e)))?;
        Ok(Box::new(stream))
    }

    async fn listen_remote(&self, address: &str, port: u16) -> Result<RemoteListener, SshError> {
        self.ensure_alive()?;
        if self.server.refused_listen_ports.lock().contains(&port) {
            return Err(SshError::BindFailed(format!("{}:{} refused by server", address, port)));
        }

        let bound_port = if port == 0 {
            self.server.next_port.fetch_add(1, Ordering::SeqCst)
        } else {
            port
        };
        let key = (address.to_string(), bound_port);

        let (tx, incoming) = mpsc::channel(16);
        {
            let mut listeners = self.server.listeners.lock();
            if listeners.contains_key(&key) {
                return Err(SshError::BindFailed(format!("{}:{} already bound", address, bound_port)));
            }
            listeners.insert(key.clone(), tx);
        }
        self.listeners.lock().push(key);

        Ok(RemoteListener {
            bound_port,
            incoming,
        })
    }

    async fn cancel_remote(&self, address: &str, port: u16) -> Result<(), SshError> {
        let key = (address.to_string(), port);
        self.listeners.lock().retain(|k| *k != key);
        self.server.listeners.lock().remove(&key);
        self.ensure_alive()
    }

    async fn health_check(&self) -> ProbeOutcome {
        if self.killed.is_cancelled() {
            ProbeOutcome::Closed
        } else if self.server.probe_failing.load(Ordering::SeqCst) {
            ProbeOutcome::Degraded
        } else {
            ProbeOutcome::Healthy
        }
    }

    async fn closed(&self) {
        self.killed.cancelled().await;
    }

    async fn close(&self) {
        self.shutdown();
    }

    fn is_closed(&self) -> bool {
        self.killed.is_cancelled()
    }
}
