//! Local Port Forwarding
//!
//! Forwards connections from a local port to a remote host:port through SSH.
//! Example: local 127.0.0.1:8080 -> 10.0.0.5:80 as seen from the server

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::bridge::{relay, ForwardStatsAtomic};
use super::events::ForwardEventEmitter;
use super::ports::PortRegistry;
use super::{drain_connections, with_retry, ChannelHealth, ForwardSpec, ForwarderHandle, ForwarderOptions};
use crate::ssh::SshError;
use crate::transport::{ChannelPurpose, SessionHandle};

fn bind_error(addr: &str, e: std::io::Error) -> SshError {
    match e.kind() {
        std::io::ErrorKind::AddrInUse => SshError::BindFailed(format!(
            "Port already in use: {}. Another application may be using this port.",
            addr
        )),
        std::io::ErrorKind::PermissionDenied => SshError::BindFailed(format!(
            "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
            addr
        )),
        std::io::ErrorKind::AddrNotAvailable => SshError::BindFailed(format!(
            "Address not available: {}. The specified address is not valid on this system.",
            addr
        )),
        _ => SshError::BindFailed(format!("Failed to bind to {}: {}", addr, e)),
    }
}

pub(super) async fn start_local_forward(
    spec: ForwardSpec,
    session: SessionHandle,
    ports: &PortRegistry,
    options: &ForwarderOptions,
    events: &ForwardEventEmitter,
) -> Result<ForwarderHandle, SshError> {
    let local_addr = spec.local_addr();
    let claim = ports.claim(&spec.local_host, spec.local_port, &spec.label())?;

    let listener = TcpListener::bind((spec.local_host.as_str(), spec.local_port))
        .await
        .map_err(|e| bind_error(&local_addr, e))?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| SshError::BindFailed(format!("Failed to get bound address: {}", e)))?;

    info!(
        "Started local port forward {}: {} -> {}",
        spec.label(),
        bound_addr,
        spec.remote_addr()
    );

    let cancel = CancellationToken::new();
    let stats = ForwardStatsAtomic::new();
    let task = tokio::spawn(accept_loop(
        listener,
        spec.clone(),
        session,
        options.clone(),
        events.clone(),
        stats.clone(),
        cancel.clone(),
    ));

    Ok(ForwarderHandle {
        spec,
        instance: events.instance(),
        bound_port: bound_addr.port(),
        cancel,
        task,
        stats,
        _claim: Some(claim),
    })
}

async fn accept_loop(
    listener: TcpListener,
    spec: ForwardSpec,
    session: SessionHandle,
    options: ForwarderOptions,
    events: ForwardEventEmitter,
    stats: Arc<ForwardStatsAtomic>,
    cancel: CancellationToken,
) {
    let health = Arc::new(ChannelHealth::default());
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {} on {}", peer, spec.label());
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY: {}", e);
                    }
                    connections.spawn(handle_connection(
                        stream,
                        spec.clone(),
                        session.clone(),
                        options.clone(),
                        events.clone(),
                        health.clone(),
                        stats.clone(),
                        cancel.child_token(),
                    ));
                }
                Err(e) => {
                    error!("Accept failed on {}: {}", spec.label(), e);
                    events.emit_listener_closed(&spec.link_id, format!("accept failed: {}", e));
                    break;
                }
            },

            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    // Listener closes here, before in-flight connections drain
    drop(listener);
    drain_connections(&mut connections, options.stop_grace, &spec.label()).await;
    info!("Local port forward {} stopped", spec.label());
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    stream: TcpStream,
    spec: ForwardSpec,
    session: SessionHandle,
    options: ForwarderOptions,
    events: ForwardEventEmitter,
    health: Arc<ChannelHealth>,
    stats: Arc<ForwardStatsAtomic>,
    cancel: CancellationToken,
) {
    let _guard = stats.open_connection();

    let purpose = ChannelPurpose::DirectTcpip {
        host: spec.remote_host.clone(),
        port: spec.remote_port,
    };
    let session = &session;
    let opened = with_retry(
        options.channel_retry_limit,
        options.channel_retry_delay,
        &cancel,
        || session.open_channel(purpose.clone()),
    )
    .await;

    let channel = match opened {
        None => return,
        Some(Ok(channel)) => {
            health.record_success(&events, &spec.link_id);
            channel
        }
        Some(Err(e)) => {
            // Dropping the socket resets the client
            health.record_failure(&events, &spec.link_id, &e);
            return;
        }
    };

    relay(stream, channel, options.idle_timeout, &stats, &cancel).await;
}
