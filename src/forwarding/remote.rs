//! Remote Port Forwarding
//!
//! The server listens on remote_host:remote_port and every connection it
//! accepts is relayed to local_host:local_port on this machine.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bridge::{relay, ForwardStatsAtomic};
use super::events::ForwardEventEmitter;
use super::{drain_connections, with_retry, ChannelHealth, ForwardSpec, ForwarderHandle, ForwarderOptions};
use crate::ssh::SshError;
use crate::transport::{InboundConnection, RemoteListener, SessionHandle};

enum ListenerExit {
    Stopped,
    Closed,
}

pub(super) async fn start_remote_forward(
    spec: ForwardSpec,
    session: SessionHandle,
    options: &ForwarderOptions,
    events: &ForwardEventEmitter,
) -> Result<ForwarderHandle, SshError> {
    let listener = session
        .listen_remote(&spec.remote_host, spec.remote_port)
        .await?;
    let bound_port = listener.bound_port;

    info!(
        "Started remote port forward {}: {}:{} -> {}",
        spec.label(),
        spec.remote_host,
        bound_port,
        spec.local_addr()
    );

    let cancel = CancellationToken::new();
    let stats = ForwardStatsAtomic::new();
    let task = tokio::spawn(serve_inbound(
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
        bound_port,
        cancel,
        task,
        stats,
        _claim: None,
    })
}

async fn serve_inbound(
    listener: RemoteListener,
    spec: ForwardSpec,
    session: SessionHandle,
    options: ForwarderOptions,
    events: ForwardEventEmitter,
    stats: Arc<ForwardStatsAtomic>,
    cancel: CancellationToken,
) {
    let RemoteListener {
        bound_port,
        mut incoming,
    } = listener;
    let health = Arc::new(ChannelHealth::default());
    let mut connections = JoinSet::new();

    let exit = loop {
        tokio::select! {
            _ = cancel.cancelled() => break ListenerExit::Stopped,

            inbound = incoming.recv() => match inbound {
                Some(inbound) => {
                    debug!("Inbound connection from {} on {}", inbound.originator, spec.label());
                    connections.spawn(handle_inbound(
                        inbound,
                        spec.clone(),
                        options.clone(),
                        events.clone(),
                        health.clone(),
                        stats.clone(),
                        cancel.child_token(),
                    ));
                }
                None => break ListenerExit::Closed,
            },

            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    };

    match exit {
        ListenerExit::Stopped => {
            if let Err(e) = session.cancel_remote(&spec.remote_host, bound_port).await {
                debug!("Cancel of remote listener {} failed: {}", spec.label(), e);
            }
        }
        ListenerExit::Closed => {
            warn!("Remote listener for {} closed", spec.label());
            events.emit_listener_closed(&spec.link_id, "remote listener closed".into());
        }
    }

    drain_connections(&mut connections, options.stop_grace, &spec.label()).await;
    info!("Remote port forward {} stopped", spec.label());
}

async fn handle_inbound(
    inbound: InboundConnection,
    spec: ForwardSpec,
    options: ForwarderOptions,
    events: ForwardEventEmitter,
    health: Arc<ChannelHealth>,
    stats: Arc<ForwardStatsAtomic>,
    cancel: CancellationToken,
) {
    let _guard = stats.open_connection();

    let target = &spec;
    let dialed = with_retry(
        options.channel_retry_limit,
        options.channel_retry_delay,
        &cancel,
        || async move {
            let stream = TcpStream::connect((target.local_host.as_str(), target.local_port))
                .await
                .map_err(|e| {
                    SshError::ChannelError(format!("connect to {} failed: {}", target.local_addr(), e))
                })?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY: {}", e);
            }
            Ok(stream)
        },
    )
    .await;

    let local = match dialed {
        None => return,
        Some(Ok(local)) => {
            health.record_success(&events, &spec.link_id);
            local
        }
        Some(Err(e)) => {
            health.record_failure(&events, &spec.link_id, &e);
            return;
        }
    };

    relay(local, inbound.stream, options.idle_timeout, &stats, &cancel).await;
}
