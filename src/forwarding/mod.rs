//! Port Forwarding Module
//!
//! One forwarder per open link:
//! - Forward mode: listen locally, relay each connection over a direct channel
//! - Penetrate mode: ask the server to listen, relay each inbound connection
//!   to a local target

mod bridge;
mod events;
mod local;
mod ports;
mod remote;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use bridge::{relay, ForwardStats, ForwardStatsAtomic};
pub use events::{ForwardEvent, ForwardEventEmitter};
pub use ports::{PortClaim, PortRegistry};

use crate::config::{LinkGroup, Settings};
use crate::ssh::SshError;
use crate::transport::SessionHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardMode {
    /// Local listener, remote target
    Forward,
    /// Remote listener, local target
    Penetrate,
}

/// Everything a forwarder needs to know about one link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub server_id: String,
    pub link_id: String,
    pub mode: ForwardMode,
    pub local_host: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl ForwardSpec {
    pub fn from_link(server_id: &str, link: &LinkGroup) -> Self {
        Self {
            server_id: server_id.to_string(),
            link_id: link.id.clone(),
            mode: if link.is_penetrate {
                ForwardMode::Penetrate
            } else {
                ForwardMode::Forward
            },
            local_host: link.local_host.trim().to_string(),
            local_port: link.local_port,
            remote_host: link.remote_host.trim().to_string(),
            remote_port: link.remote_port,
        }
    }

    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    /// `server/link`, used in logs and port claims
    pub fn label(&self) -> String {
        format!("{}/{}", self.server_id, self.link_id)
    }
}

#[derive(Debug, Clone)]
pub struct ForwarderOptions {
    pub idle_timeout: Duration,
    pub stop_grace: Duration,
    pub channel_retry_limit: u32,
    pub channel_retry_delay: Duration,
}

impl ForwarderOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            idle_timeout: settings.idle_timeout(),
            stop_grace: settings.stop_grace(),
            channel_retry_limit: settings.channel_retry_limit,
            channel_retry_delay: settings.channel_retry_delay(),
        }
    }
}

impl Default for ForwarderOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Starts forwarders for one server group
pub struct Forwarder {
    ports: PortRegistry,
    options: ForwarderOptions,
    events: ForwardEventEmitter,
    next_instance: AtomicU64,
}

impl Forwarder {
    pub fn new(ports: PortRegistry, options: ForwarderOptions, events: ForwardEventEmitter) -> Self {
        Self {
            ports,
            options,
            events,
            next_instance: AtomicU64::new(1),
        }
    }

    /// Bind the listener for `spec` and start relaying. Bind failures are
    /// returned here; later failures arrive as [`ForwardEvent`]s.
    pub async fn start(
        &self,
        spec: ForwardSpec,
        session: SessionHandle,
    ) -> Result<ForwarderHandle, SshError> {
        let events = self
            .events
            .for_instance(self.next_instance.fetch_add(1, Ordering::Relaxed));
        match spec.mode {
            ForwardMode::Forward => {
                local::start_local_forward(spec, session, &self.ports, &self.options, &events).await
            }
            ForwardMode::Penetrate => {
                remote::start_remote_forward(spec, session, &self.options, &events).await
            }
        }
    }
}

/// Handle to a running forwarder
pub struct ForwarderHandle {
    spec: ForwardSpec,
    instance: u64,
    bound_port: u16,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    stats: Arc<ForwardStatsAtomic>,
    _claim: Option<PortClaim>,
}

impl ForwarderHandle {
    pub fn spec(&self) -> &ForwardSpec {
        &self.spec
    }

    /// Matches [`ForwardEvent::instance`] for events this forwarder raised
    pub fn instance(&self) -> u64 {
        self.instance
    }

    /// Port actually listened on, local or remote depending on mode
    pub fn bound_port(&self) -> u16 {
        self.bound_port
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats.to_stats()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop accepting, give in-flight connections the grace period, then
    /// abort them. The local port is free once this returns.
    pub async fn stop(self) {
        info!("Stopping forward {} ({})", self.spec.label(), self.bound_port);
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!("Forward task for {} panicked: {}", self.spec.label(), e);
            }
        }
    }
}

/// Wait for connection tasks to finish, aborting them after `grace`
pub(crate) async fn drain_connections(connections: &mut JoinSet<()>, grace: Duration, label: &str) {
    if connections.is_empty() {
        return;
    }
    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "Aborting {} connection(s) of {} after grace period",
            connections.len(),
            label
        );
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }
}

/// Run `op` up to `limit` times, sleeping `delay` between attempts.
/// Returns `None` if cancelled first.
pub(crate) async fn with_retry<T, F, Fut>(
    limit: u32,
    delay: Duration,
    cancel: &CancellationToken,
    mut op: F,
) -> Option<Result<T, SshError>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SshError>>,
{
    let limit = limit.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = op() => result,
        };
        match result {
            Ok(value) => return Some(Ok(value)),
            Err(e) if attempt >= limit || !e.is_retryable() => return Some(Err(e)),
            Err(e) => {
                debug!("Attempt {}/{} failed: {}", attempt, limit, e);
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Edge detector so a link reports failure and recovery once per transition
#[derive(Debug, Default)]
pub(crate) struct ChannelHealth {
    failing: AtomicBool,
}

impl ChannelHealth {
    pub fn record_success(&self, events: &ForwardEventEmitter, link_id: &str) {
        if self.failing.swap(false, Ordering::SeqCst) {
            info!("Link {} channels recovered", link_id);
            events.emit_channel_recovered(link_id);
        }
    }

    pub fn record_failure(&self, events: &ForwardEventEmitter, link_id: &str, error: &SshError) {
        if !self.failing.swap(true, Ordering::SeqCst) {
            warn!("Link {} channel setup failing: {}", link_id, error);
            events.emit_channel_failed(link_id, error.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_retry_gives_up_after_limit() {
        let calls = AtomicU32::new(0);
        let result: Option<Result<(), SshError>> =
            with_retry(3, Duration::from_millis(1), &CancellationToken::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SshError::ChannelError("refused".into())) }
            })
            .await;
        assert!(matches!(result, Some(Err(SshError::ChannelError(_)))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_succeeds_midway() {
        let calls = AtomicU32::new(0);
        let result = with_retry(3, Duration::from_millis(1), &CancellationToken::new(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(SshError::ChannelError("busy".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retry_skips_non_retryable() {
        let calls = AtomicU32::new(0);
        let result: Option<Result<(), SshError>> =
            with_retry(5, Duration::from_millis(1), &CancellationToken::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SshError::BindFailed("in use".into())) }
            })
            .await;
        assert!(result.unwrap().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_health_reports_transitions_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = ForwardEventEmitter::new(tx, "s1".into());
        let health = ChannelHealth::default();
        let err = SshError::ChannelError("refused".into());

        health.record_success(&events, "l1");
        health.record_failure(&events, "l1", &err);
        health.record_failure(&events, "l1", &err);
        health.record_success(&events, "l1");
        health.record_success(&events, "l1");

        assert!(matches!(rx.try_recv().unwrap(), ForwardEvent::ChannelFailed { .. }));
        assert!(matches!(rx.try_recv().unwrap(), ForwardEvent::ChannelRecovered { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_spec_from_link() {
        let link = LinkGroup {
            id: "l1".into(),
            name: "web".into(),
            local_host: " 127.0.0.1 ".into(),
            local_port: 8080,
            remote_host: "10.0.0.5".into(),
            remote_port: 80,
            notes: String::new(),
            is_penetrate: false,
            is_open: true,
        };
        let spec = ForwardSpec::from_link("s1", &link);
        assert_eq!(spec.mode, ForwardMode::Forward);
        assert_eq!(spec.local_addr(), "127.0.0.1:8080");
        assert_eq!(spec.remote_addr(), "10.0.0.5:80");
        assert_eq!(spec.label(), "s1/l1");
    }
}
