//! russh-backed transport

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    BoxedStream, ChannelPurpose, InboundConnection, ProbeOutcome, RemoteListener, SessionHandle, Transport,
    TransportSession,
};
use crate::ssh::{
    HandleController, PingResult, RemoteForwardRegistry, Socks5Proxy, SshClient, SshConfig,
    SshError,
};

/// Inbound connections buffered per remote listener
const REMOTE_BACKLOG: usize = 64;

/// Opens SSH sessions, optionally through a SOCKS5 proxy
#[derive(Debug, Clone)]
pub struct SshTransport {
    proxy: Option<Socks5Proxy>,
    probe_timeout: Duration,
}

impl SshTransport {
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            proxy: None,
            probe_timeout,
        }
    }

    pub fn with_proxy(mut self, proxy: Option<Socks5Proxy>) -> Self {
        self.proxy = proxy;
        self
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn open(&self, config: &SshConfig) -> Result<SessionHandle, SshError> {
        let connection = SshClient::new(config.clone())
            .with_proxy(self.proxy.clone())
            .with_probe_timeout(self.probe_timeout)
            .connect()
            .await?;

        Ok(Arc::new(SshSession {
            address: config.address(),
            controller: connection.controller,
            forwards: connection.forwards,
            listeners: Mutex::new(HashMap::new()),
        }))
    }
}

/// One live SSH connection
pub struct SshSession {
    address: String,
    controller: HandleController,
    forwards: Arc<RemoteForwardRegistry>,
    /// Senders this session registered, keyed by the bound address
    listeners: Mutex<HashMap<(String, u32), mpsc::Sender<InboundConnection>>>,
}

#[async_trait]
impl TransportSession for SshSession {
    async fn open_channel(&self, purpose: ChannelPurpose) -> Result<BoxedStream, SshError> {
        match purpose {
            ChannelPurpose::DirectTcpip { host, port } => {
                let channel = self
                    .controller
                    .open_direct_tcpip(&host, port as u32, "127.0.0.1", 0)
                    .await?;
                debug!("Opened channel to {}:{} over {}", host, port, self.address);
                Ok(Box::new(channel.into_stream()))
            }
        }
    }

    async fn listen_remote(&self, address: &str, port: u16) -> Result<RemoteListener, SshError> {
        let (tx, incoming) = mpsc::channel(REMOTE_BACKLOG);

        // Register first so a connection racing the reply is not lost
        self.forwards.register(address, port as u32, &tx)?;
        let bound = match self.controller.tcpip_forward(address, port as u32).await {
            Ok(bound) => bound,
            Err(e) => {
                self.forwards.unregister(address, port as u32, &tx);
                return Err(e);
            }
        };

        if let Err(e) = self.forwards.rebind(address, port as u32, bound, &tx) {
            let _ = self.controller.cancel_tcpip_forward(address, bound).await;
            return Err(e);
        }
        self.listeners.lock().insert((address.to_string(), bound), tx);
        Ok(RemoteListener {
            bound_port: bound as u16,
            incoming,
        })
    }

    async fn cancel_remote(&self, address: &str, port: u16) -> Result<(), SshError> {
        let key = (address.to_string(), port as u32);
        if let Some(tx) = self.listeners.lock().remove(&key) {
            self.forwards.unregister(address, port as u32, &tx);
        }
        self.controller
            .cancel_tcpip_forward(address, port as u32)
            .await
    }

    async fn health_check(&self) -> ProbeOutcome {
        match self.controller.ping().await {
            PingResult::Ok => ProbeOutcome::Healthy,
            PingResult::Timeout => ProbeOutcome::Degraded,
            PingResult::IoError => ProbeOutcome::Closed,
        }
    }

    async fn closed(&self) {
        let mut disconnect_rx = self.controller.subscribe_disconnect();
        if !self.controller.is_connected() {
            return;
        }
        let _ = disconnect_rx.recv().await;
    }

    async fn close(&self) {
        self.controller.disconnect().await;
    }

    fn is_closed(&self) -> bool {
        !self.controller.is_connected()
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if !self.forwards.is_empty() {
            warn!(
                "{} remote forward(s) still registered when session to {} was dropped",
                self.forwards.len(),
                self.address
            );
        }
    }
}
