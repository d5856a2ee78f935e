//! Handle Owner Task
//!
//! Only one task owns the russh `Handle<ClientHandler>`. Forwarders and the
//! keep-alive monitor talk to it through a cloneable [`HandleController`]
//! which sends commands over an mpsc channel and waits for a oneshot reply.
//! No lock is held across `.await`; requests that only read the handle
//! are driven side by side inside the owner task.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// A direct-tcpip open with no confirmation by then is failed
const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(20);

/// Outcome of one keep-alive probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    /// Reply received
    Ok,
    /// No reply in time, the connection may still recover
    Timeout,
    /// The connection is gone
    IoError,
}

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a direct-tcpip channel (forward mode)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Ask the server to listen (penetrate mode)
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },

    /// Withdraw a server-side listener
    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },

    /// `keepalive@openssh.com` with want_reply
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },

    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning only copies the sender; every clone has full control of the
/// connection, so it must stay inside the process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    /// Fired once when the owner task exits
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Controller over an arbitrary command channel, used by tests
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self {
            cmd_tx,
            disconnect_tx,
        }
    }

    /// Receiver that yields `()` when the SSH connection is closed
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    /// Send one command and wait for the owner task's reply
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> HandleCommand,
    ) -> Result<T, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx.await.map_err(|_| SshError::Disconnected)
    }

    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        self.request(|reply_tx| HandleCommand::ChannelOpenDirectTcpip {
            host: host.to_string(),
            port,
            originator_host: originator_host.to_string(),
            originator_port,
            reply_tx,
        })
        .await?
        .map_err(|e| SshError::ChannelError(format!("{}:{}: {}", host, port, e)))
    }

    /// Request a remote listener, returning the port the server bound
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, SshError> {
        self.request(|reply_tx| HandleCommand::TcpipForward {
            address: address.to_string(),
            port,
            reply_tx,
        })
        .await?
        .map_err(|e| {
            SshError::BindFailed(format!(
                "Server refused to listen on {}:{}: {}",
                address, port, e
            ))
        })
    }

    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), SshError> {
        self.request(|reply_tx| HandleCommand::CancelTcpipForward {
            address: address.to_string(),
            port,
            reply_tx,
        })
        .await?
        .map_err(|e| SshError::ProtocolError(e.to_string()))
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    pub async fn ping(&self) -> PingResult {
        self.request(|reply_tx| HandleCommand::Ping { reply_tx })
            .await
            .unwrap_or(PingResult::IoError)
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// The operations the owner task performs on its handle
#[async_trait]
pub(crate) trait OwnedHandle: Send + Sync + 'static {
    async fn open_direct_tcpip(
        &self,
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
    ) -> Result<Channel<Msg>, russh::Error>;

    async fn tcpip_forward(&mut self, address: &str, port: u32) -> Result<u32, russh::Error>;

    async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), russh::Error>;

    async fn keepalive(&self) -> Result<(), russh::Error>;

    fn is_closed(&self) -> bool;

    async fn disconnect(&self);
}

#[async_trait]
impl OwnedHandle for Handle<ClientHandler> {
    async fn open_direct_tcpip(
        &self,
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
    ) -> Result<Channel<Msg>, russh::Error> {
        self.channel_open_direct_tcpip(host, port, originator_host, originator_port)
            .await
    }

    async fn tcpip_forward(&mut self, address: &str, port: u32) -> Result<u32, russh::Error> {
        Handle::tcpip_forward(self, address, port).await
    }

    async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), russh::Error> {
        Handle::cancel_tcpip_forward(self, address, port).await
    }

    async fn keepalive(&self) -> Result<(), russh::Error> {
        self.send_keepalive(true).await
    }

    fn is_closed(&self) -> bool {
        Handle::is_closed(self)
    }

    async fn disconnect(&self) {
        let _ = Handle::disconnect(self, russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
    }
}

/// Spawn the Handle Owner Task
///
/// Takes ownership of `handle`. `probe_timeout` bounds each keep-alive reply.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    session_id: String,
    probe_timeout: Duration,
) -> HandleController {
    spawn_owner(handle, session_id, probe_timeout)
}

/// Channel opens, cancels and probes run concurrently so a target that
/// never answers cannot stall its siblings or the keep-alive. Listener
/// requests need `&mut` access and run once no open is in flight.
pub(crate) fn spawn_owner<H: OwnedHandle>(
    handle: H,
    session_id: String,
    probe_timeout: Duration,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_clone = disconnect_tx.clone();

    tokio::spawn(async move {
        let mut handle = handle; // sole owner from here on
        let mut listen_requests: VecDeque<HandleCommand> = VecDeque::new();
        let mut held_opens: VecDeque<HandleCommand> = VecDeque::new();

        info!("Handle owner task started for {}", session_id);

        'owner: loop {
            while let Some(cmd) = listen_requests.pop_front() {
                if let HandleCommand::TcpipForward {
                    address,
                    port,
                    reply_tx,
                } = cmd
                {
                    request_listener(&mut handle, address, port, reply_tx).await;
                }
            }

            let mut in_flight: FuturesUnordered<BoxFuture<'_, ()>> = FuturesUnordered::new();
            for cmd in held_opens.drain(..) {
                in_flight.push(Box::pin(serve(&handle, cmd, probe_timeout, &session_id)));
            }

            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        None => break 'owner,
                        Some(HandleCommand::Disconnect) => {
                            info!("Disconnect requested for {}", session_id);
                            break 'owner;
                        }
                        Some(cmd @ HandleCommand::TcpipForward { .. }) => {
                            listen_requests.push_back(cmd);
                            if in_flight.is_empty() {
                                break;
                            }
                        }
                        // New opens queue behind a waiting listener request
                        Some(cmd @ HandleCommand::ChannelOpenDirectTcpip { .. })
                            if !listen_requests.is_empty() =>
                        {
                            held_opens.push_back(cmd);
                        }
                        Some(cmd) => {
                            in_flight.push(Box::pin(serve(&handle, cmd, probe_timeout, &session_id)))
                        }
                    },

                    Some(()) = in_flight.next(), if !in_flight.is_empty() => {
                        if in_flight.is_empty() && !listen_requests.is_empty() {
                            break;
                        }
                    }
                }
            }
        }

        let _ = disconnect_tx_clone.send(());
        listen_requests
            .drain(..)
            .chain(held_opens.drain(..))
            .for_each(refuse);
        drain_pending_commands(&mut cmd_rx);

        handle.disconnect().await;
        info!("Handle owner task terminated for {}", session_id);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

/// Run one command that only needs shared access to the handle
async fn serve<H: OwnedHandle>(
    handle: &H,
    cmd: HandleCommand,
    probe_timeout: Duration,
    session_id: &str,
) {
    match cmd {
        HandleCommand::ChannelOpenDirectTcpip {
            host,
            port,
            originator_host,
            originator_port,
            reply_tx,
        } => {
            let open = handle.open_direct_tcpip(host.clone(), port, originator_host, originator_port);
            let result = match tokio::time::timeout(CHANNEL_OPEN_TIMEOUT, open).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        "No answer to channel open for {}:{} on {} after {:?}",
                        host, port, session_id, CHANNEL_OPEN_TIMEOUT
                    );
                    Err(russh::Error::ConnectionTimeout)
                }
            };
            if reply_tx.send(result).is_err() {
                // The dropped channel is closed by the server
                debug!("Caller dropped before receiving direct_tcpip result");
            }
        }

        HandleCommand::CancelTcpipForward {
            address,
            port,
            reply_tx,
        } => {
            let _ = reply_tx.send(handle.cancel_tcpip_forward(&address, port).await);
        }

        HandleCommand::Ping { reply_tx } => {
            let _ = reply_tx.send(probe(handle, probe_timeout, session_id).await);
        }

        HandleCommand::TcpipForward { reply_tx, .. } => {
            let _ = reply_tx.send(Err(russh::Error::RequestDenied));
        }

        HandleCommand::Disconnect => {}
    }
}

async fn request_listener<H: OwnedHandle>(
    handle: &mut H,
    address: String,
    port: u32,
    reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
) {
    match handle.tcpip_forward(&address, port).await {
        Ok(bound_port) => {
            if reply_tx.send(Ok(bound_port)).is_err() {
                // Nobody will ever cancel this listener
                warn!(
                    "Caller dropped after tcpip_forward succeeded, cancelling {}:{}",
                    address, bound_port
                );
                let _ = handle.cancel_tcpip_forward(&address, bound_port).await;
            }
        }
        Err(e) => {
            let _ = reply_tx.send(Err(e));
        }
    }
}

/// One `keepalive@openssh.com` round trip
async fn probe<H: OwnedHandle>(handle: &H, timeout: Duration, session_id: &str) -> PingResult {
    match tokio::time::timeout(timeout, handle.keepalive()).await {
        Ok(Ok(())) => PingResult::Ok,
        Ok(Err(russh::Error::Disconnect)) => {
            warn!("Keepalive found {} disconnected", session_id);
            PingResult::IoError
        }
        Ok(Err(e)) if handle.is_closed() => {
            warn!("Keepalive found {} closed: {}", session_id, e);
            PingResult::IoError
        }
        Ok(Err(e)) => {
            debug!("Keepalive soft failure for {}: {}", session_id, e);
            PingResult::Timeout
        }
        Err(_) => {
            debug!("Keepalive timeout for {} ({:?})", session_id, timeout);
            PingResult::Timeout
        }
    }
}

/// Reply `Disconnect` to every queued command
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        refuse(cmd);
    }
}

fn refuse(cmd: HandleCommand) {
    match cmd {
        HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
            let _ = reply_tx.send(Err(russh::Error::Disconnect));
        }
        HandleCommand::TcpipForward { reply_tx, .. } => {
            let _ = reply_tx.send(Err(russh::Error::Disconnect));
        }
        HandleCommand::CancelTcpipForward { reply_tx, .. } => {
            let _ = reply_tx.send(Err(russh::Error::Disconnect));
        }
        HandleCommand::Ping { reply_tx } => {
            let _ = reply_tx.send(PingResult::IoError);
        }
        HandleCommand::Disconnect => {}
    }
}
