//! Server group supervisor
//!
//! One task per open server group. It owns the transport session and the
//! forwarders of the group and walks the state machine:
//!
//! ```text
//! closed -> connecting -> open -> degraded -> connecting -> ...
//!                 \                   \
//!                  `-> closed (auth)   `-> closed (attempts exhausted)
//! ```
//!
//! Commands from the manager and events from the keep-alive monitor and the
//! forwarders are handled in the task's select loop, so no state is shared.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::reconnect::ReconnectPolicy;
use super::status::StatusBoard;
use super::types::{LinkState, ServerState, SessionHealth};
use crate::config::{CredentialResolver, ServerGroup, Settings};
use crate::forwarding::{
    ForwardEvent, ForwardEventEmitter, ForwardSpec, Forwarder, ForwarderHandle, ForwarderOptions,
    PortRegistry,
};
use crate::ssh::ErrorKind;
use crate::transport::{spawn_keepalive, HealthEvent, KeepaliveConfig, SessionHandle, Transport};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) enum SupervisorCommand {
    /// Same connection, new link set or metadata
    Update(ServerGroup),
    /// Leave the closed-with-error state and connect now
    Retry,
    Stop { reply: oneshot::Sender<()> },
}

/// Shared services every supervisor needs
#[derive(Clone)]
pub(crate) struct SupervisorContext {
    pub transport: Arc<dyn Transport>,
    pub credentials: CredentialResolver,
    pub ports: PortRegistry,
    pub status: Arc<StatusBoard>,
    pub settings: Settings,
}

pub(crate) struct SupervisorHandle {
    cmd_tx: mpsc::UnboundedSender<SupervisorCommand>,
    task: JoinHandle<()>,
    signature: String,
}

impl SupervisorHandle {
    /// Connection signature the supervisor was started with
    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn update(&self, group: ServerGroup) {
        let _ = self.cmd_tx.send(SupervisorCommand::Update(group));
    }

    pub fn retry(&self) {
        let _ = self.cmd_tx.send(SupervisorCommand::Retry);
    }

    /// Tear down forwarders and session, then wait for the task
    pub async fn stop(self) {
        let (reply, done) = oneshot::channel();
        if self.cmd_tx.send(SupervisorCommand::Stop { reply }).is_ok() {
            let _ = done.await;
        }
        if let Err(e) = self.task.await {
            warn!("Supervisor task failed: {}", e);
        }
    }
}

pub(crate) fn spawn_supervisor(group: ServerGroup, ctx: SupervisorContext) -> SupervisorHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (forward_tx, forward_rx) = mpsc::unbounded_channel();
    let signature = group.connection_signature();

    let forwarder = Forwarder::new(
        ctx.ports.clone(),
        ForwarderOptions::from_settings(&ctx.settings),
        ForwardEventEmitter::new(forward_tx, group.id.clone()),
    );
    let supervisor = Supervisor {
        id: group.id.clone(),
        policy: ReconnectPolicy::from_settings(&ctx.settings),
        desired: group,
        ctx,
        cmd_rx,
        forwarder,
        forward_rx,
        forwarders: HashMap::new(),
        failed: HashMap::new(),
    };

    SupervisorHandle {
        cmd_tx,
        task: tokio::spawn(supervisor.run()),
        signature,
    }
}

enum Flow {
    Updated,
    Retry,
    Stop(Option<oneshot::Sender<()>>),
}

enum Next {
    Connect,
    Backoff { error: String },
    Failed { error: String },
    Stop(Option<oneshot::Sender<()>>),
}

enum OpenExit {
    Lost(String),
    Stopped(Option<oneshot::Sender<()>>),
}

struct Supervisor {
    id: String,
    desired: ServerGroup,
    ctx: SupervisorContext,
    policy: ReconnectPolicy,
    cmd_rx: mpsc::UnboundedReceiver<SupervisorCommand>,
    forwarder: Forwarder,
    forward_rx: mpsc::UnboundedReceiver<ForwardEvent>,
    /// Running forwarders by link id
    forwarders: HashMap<String, ForwarderHandle>,
    /// Links whose start failed, by the forward signature that failed
    failed: HashMap<String, String>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut attempt = 0u32;
        let mut next = Next::Connect;
        loop {
            next = match next {
                Next::Connect => self.connect(&mut attempt).await,
                Next::Backoff { error } => self.backoff(&mut attempt, error).await,
                Next::Failed { error } => self.wait_for_retry(&mut attempt, error).await,
                Next::Stop(reply) => {
                    self.ctx.status.mark_closed(&self.id, None);
                    info!("Server group {} stopped", self.id);
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    return;
                }
            };
        }
    }

    fn on_command(&mut self, cmd: Option<SupervisorCommand>) -> Flow {
        match cmd {
            Some(SupervisorCommand::Update(group)) => {
                self.desired = group;
                Flow::Updated
            }
            Some(SupervisorCommand::Retry) => Flow::Retry,
            Some(SupervisorCommand::Stop { reply }) => Flow::Stop(Some(reply)),
            None => Flow::Stop(None),
        }
    }

    /// Publish a server transition. Anything but `Open` takes the links down.
    fn report(&self, state: ServerState, health: SessionHealth, attempt: u32, error: Option<String>) {
        self.ctx.status.update(&self.id, |status| {
            status.state = state;
            status.health = health;
            status.reconnect_attempt = attempt;
            if state == ServerState::Open {
                status.last_error = None;
            } else {
                if error.is_some() {
                    status.last_error = error;
                }
                status.missed_probes = 0;
                for link in &mut status.links {
                    link.state = LinkState::Inactive;
                    link.bound_port = None;
                }
            }
        });
    }

    async fn connect(&mut self, attempt: &mut u32) -> Next {
        self.report(ServerState::Connecting, SessionHealth::Connecting, *attempt, None);

        let config = match self.ctx.credentials.resolve(&self.desired, &self.ctx.settings) {
            Ok(config) => config,
            Err(e) => return Next::Failed { error: e.to_string() },
        };
        info!(
            "Connecting server group {} ({}@{})",
            self.id,
            config.username,
            config.address()
        );

        let transport = self.ctx.transport.clone();
        let connecting = async move { transport.open(&config).await };
        tokio::pin!(connecting);

        let result = loop {
            tokio::select! {
                result = &mut connecting => break result,
                cmd = self.cmd_rx.recv() => match self.on_command(cmd) {
                    Flow::Updated | Flow::Retry => {}
                    Flow::Stop(reply) => return Next::Stop(reply),
                },
            }
        };

        match result {
            Ok(session) => {
                *attempt = 0;
                match self.run_open(session).await {
                    OpenExit::Stopped(reply) => Next::Stop(reply),
                    OpenExit::Lost(reason) => Next::Backoff { error: reason },
                }
            }
            Err(e) if e.kind() == ErrorKind::Auth => {
                warn!("Server group {} authentication failed: {}", self.id, e);
                Next::Failed { error: e.to_string() }
            }
            Err(e) => {
                warn!("Server group {} connect failed: {}", self.id, e);
                Next::Backoff { error: e.to_string() }
            }
        }
    }

    async fn backoff(&mut self, attempt: &mut u32, error: String) -> Next {
        *attempt += 1;
        if self.policy.exhausted(*attempt) {
            return Next::Failed {
                error: format!(
                    "giving up after {} reconnect attempts: {}",
                    self.policy.max_attempts, error
                ),
            };
        }

        let delay = self.policy.delay_for(*attempt);
        self.report(ServerState::Degraded, SessionHealth::Dead, *attempt, Some(error));
        info!(
            "Reconnecting server group {} in {:?} (attempt {}/{})",
            self.id, delay, attempt, self.policy.max_attempts
        );

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Next::Connect,
                cmd = self.cmd_rx.recv() => match self.on_command(cmd) {
                    Flow::Updated => {}
                    Flow::Retry => return Next::Connect,
                    Flow::Stop(reply) => return Next::Stop(reply),
                },
            }
        }
    }

    /// Closed with an error; only an explicit retry reconnects
    async fn wait_for_retry(&mut self, attempt: &mut u32, error: String) -> Next {
        warn!("Server group {} closed: {}", self.id, error);
        self.report(ServerState::Closed, SessionHealth::Dead, *attempt, Some(error));
        loop {
            let cmd = self.cmd_rx.recv().await;
            match self.on_command(cmd) {
                Flow::Updated => {}
                Flow::Retry => {
                    *attempt = 0;
                    return Next::Connect;
                }
                Flow::Stop(reply) => return Next::Stop(reply),
            }
        }
    }

    async fn run_open(&mut self, session: SessionHandle) -> OpenExit {
        info!("Server group {} open", self.id);
        self.report(ServerState::Open, SessionHealth::Healthy, 0, None);
        self.failed.clear();

        let cancel = CancellationToken::new();
        let (health_tx, mut health_rx) = mpsc::channel(8);
        let keepalive = spawn_keepalive(
            session.clone(),
            KeepaliveConfig::from_settings(&self.ctx.settings),
            cancel.clone(),
            health_tx,
        );

        self.sync_links(&session).await;

        let mut stats_tick = interval_at(Instant::now() + STATS_INTERVAL, STATS_INTERVAL);
        let exit = loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match self.on_command(cmd) {
                    Flow::Updated => self.sync_links(&session).await,
                    Flow::Retry => {}
                    Flow::Stop(reply) => break OpenExit::Stopped(reply),
                },

                Some(event) = health_rx.recv() => match event {
                    HealthEvent::Healthy => self.ctx.status.update(&self.id, |status| {
                        status.health = SessionHealth::Healthy;
                        status.missed_probes = 0;
                    }),
                    HealthEvent::Degraded { missed } => self.ctx.status.update(&self.id, |status| {
                        status.health = SessionHealth::Degraded;
                        status.missed_probes = missed;
                    }),
                    HealthEvent::Dead { reason } => {
                        warn!("Server group {} lost its connection: {}", self.id, reason);
                        break OpenExit::Lost(reason);
                    }
                },

                Some(event) = self.forward_rx.recv() => self.on_forward_event(event, &session).await,

                _ = stats_tick.tick() => self.publish_stats(),
            }
        };

        cancel.cancel();
        self.stop_forwarders().await;
        session.close().await;
        let _ = keepalive.await;
        exit
    }

    /// Bring running forwarders in line with the desired open links.
    /// Links start in configuration order so port conflicts resolve the
    /// same way every time.
    async fn sync_links(&mut self, session: &SessionHandle) {
        let desired: Vec<ForwardSpec> = self
            .desired
            .link_group
            .iter()
            .filter(|link| link.is_open)
            .map(|link| ForwardSpec::from_link(&self.id, link))
            .collect();

        let stale: Vec<String> = self
            .forwarders
            .iter()
            .filter(|(_, handle)| !desired.contains(handle.spec()))
            .map(|(link_id, _)| link_id.clone())
            .collect();
        let stopping: Vec<ForwarderHandle> = stale
            .iter()
            .filter_map(|link_id| self.forwarders.remove(link_id))
            .collect();
        join_all(stopping.into_iter().map(|handle| handle.stop())).await;
        for link_id in &stale {
            self.ctx
                .status
                .set_link(&self.id, link_id, LinkState::Inactive, None);
        }

        let desired_links = &self.desired.link_group;
        self.failed.retain(|link_id, signature| {
            desired_links
                .iter()
                .any(|link| link.is_open && link.id == *link_id && link.forward_signature() == *signature)
        });

        for link in self.desired.link_group.iter() {
            if !link.is_open {
                self.ctx
                    .status
                    .set_link(&self.id, &link.id, LinkState::Inactive, None);
                continue;
            }
            if self.forwarders.contains_key(&link.id) || self.failed.contains_key(&link.id) {
                continue;
            }

            let spec = ForwardSpec::from_link(&self.id, link);
            match self.forwarder.start(spec, session.clone()).await {
                Ok(handle) => {
                    self.ctx.status.set_link(
                        &self.id,
                        &link.id,
                        LinkState::Active,
                        Some(handle.bound_port()),
                    );
                    self.forwarders.insert(link.id.clone(), handle);
                }
                Err(e) => {
                    warn!("Link {}/{} failed to start: {}", self.id, link.id, e);
                    self.failed.insert(link.id.clone(), link.forward_signature());
                    self.ctx
                        .status
                        .set_link(&self.id, &link.id, LinkState::Error(e.to_string()), None);
                }
            }
        }
    }

    async fn on_forward_event(&mut self, event: ForwardEvent, session: &SessionHandle) {
        let link_id = event.link_id().to_string();
        let Some(bound_port) = self
            .forwarders
            .get(&link_id)
            .filter(|handle| handle.instance() == event.instance())
            .map(|handle| handle.bound_port())
        else {
            debug!("Ignoring event from stopped forwarder {}/{}", self.id, link_id);
            return;
        };

        match event {
            ForwardEvent::ChannelFailed { error, .. } => {
                self.ctx
                    .status
                    .set_link(&self.id, &link_id, LinkState::Error(error), Some(bound_port));
            }
            ForwardEvent::ChannelRecovered { .. } => {
                self.ctx
                    .status
                    .set_link(&self.id, &link_id, LinkState::Active, Some(bound_port));
            }
            ForwardEvent::ListenerClosed { reason, .. } => {
                // The health monitor reports the dead session and the link
                // goes inactive with it
                if session.is_closed() {
                    debug!("Listener of {}/{} closed with its session", self.id, link_id);
                    return;
                }
                if let Some(handle) = self.forwarders.remove(&link_id) {
                    handle.stop().await;
                }
                if let Some(link) = self.desired.link(&link_id) {
                    self.failed.insert(link_id.clone(), link.forward_signature());
                }
                self.ctx
                    .status
                    .set_link(&self.id, &link_id, LinkState::Error(reason), None);
            }
        }
    }

    fn publish_stats(&self) {
        for (link_id, handle) in &self.forwarders {
            let stats = handle.stats();
            self.ctx.status.update(&self.id, |status| {
                if let Some(link) = status.link_mut(link_id) {
                    link.stats = stats;
                }
            });
        }
    }

    async fn stop_forwarders(&mut self) {
        let handles: Vec<ForwarderHandle> = self.forwarders.drain().map(|(_, h)| h).collect();
        if !handles.is_empty() {
            debug!("Stopping {} forwarder(s) of {}", handles.len(), self.id);
        }
        join_all(handles.into_iter().map(|handle| handle.stop())).await;
    }
}
