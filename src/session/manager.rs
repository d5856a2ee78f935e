//! Session Manager
//!
//! Actor that owns the runtime copy of the configuration and one
//! supervisor per open server group. Intents are applied to the arena first;
//! the manager then reconciles supervisors against it:
//! - deleted or closed groups are stopped
//! - groups whose connection signature changed are restarted
//! - every other open group gets its new link set

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::status::{StatusBoard, StatusEvent};
use super::supervisor::{spawn_supervisor, SupervisorContext, SupervisorHandle};
use super::types::ServerStatus;
use crate::config::{Config, ConfigArena, ConfigError, CredentialResolver, Intent, ServerGroup};
use crate::forwarding::PortRegistry;
use crate::transport::Transport;

const COMMAND_BUFFER: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManagerError {
    #[error("Session manager has stopped")]
    Stopped,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

enum ManagerCommand {
    Submit {
        intent: Intent,
        reply: oneshot::Sender<Result<(), ManagerError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Config>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the manager actor
#[derive(Clone)]
pub struct SessionManager {
    cmd_tx: mpsc::Sender<ManagerCommand>,
    status: Arc<StatusBoard>,
}

impl SessionManager {
    /// Start the manager and bring up every open server group in `config`
    pub fn spawn(config: &Config, transport: Arc<dyn Transport>) -> Result<Self, ManagerError> {
        Self::spawn_with(config, transport, CredentialResolver::new())
    }

    pub fn spawn_with(
        config: &Config,
        transport: Arc<dyn Transport>,
        credentials: CredentialResolver,
    ) -> Result<Self, ManagerError> {
        let arena = ConfigArena::from_config(config)?;
        let status = Arc::new(StatusBoard::new());
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);

        let actor = ManagerActor {
            arena,
            supervisors: HashMap::new(),
            transport,
            credentials,
            ports: PortRegistry::new(),
            status: status.clone(),
        };
        tokio::spawn(actor.run(cmd_rx));

        Ok(Self { cmd_tx, status })
    }

    /// Apply an intent. Returns once the intent is accepted and the
    /// affected supervisors have been told; connections come up
    /// asynchronously and are reported through the status board.
    pub async fn submit(&self, intent: Intent) -> Result<(), ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ManagerCommand::Submit { intent, reply })
            .await
            .map_err(|_| ManagerError::Stopped)?;
        rx.await.map_err(|_| ManagerError::Stopped)?
    }

    /// Runtime configuration as the manager sees it
    pub async fn config(&self) -> Result<Config, ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ManagerCommand::Snapshot { reply })
            .await
            .map_err(|_| ManagerError::Stopped)?;
        rx.await.map_err(|_| ManagerError::Stopped)
    }

    pub fn status(&self) -> Vec<ServerStatus> {
        self.status.snapshot()
    }

    pub fn server_status(&self, server_id: &str) -> Option<ServerStatus> {
        self.status.get(server_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    /// `serverId_linkId` for every active link
    pub fn running_ids(&self) -> Vec<String> {
        self.status.active_link_ids()
    }

    /// Stop every server group and wait until all ports are released
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(ManagerCommand::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

struct ManagerActor {
    arena: ConfigArena,
    supervisors: HashMap<String, SupervisorHandle>,
    transport: Arc<dyn Transport>,
    credentials: CredentialResolver,
    ports: PortRegistry,
    status: Arc<StatusBoard>,
}

fn describe(intent: &Intent) -> String {
    match intent {
        Intent::OpenServer { server_id } => format!("open server {}", server_id),
        Intent::CloseServer { server_id } => format!("close server {}", server_id),
        Intent::OpenLink { server_id, link_id } => format!("open link {}/{}", server_id, link_id),
        Intent::CloseLink { server_id, link_id } => format!("close link {}/{}", server_id, link_id),
        Intent::UpsertServer { server } => format!("upsert server {}", server.id),
        Intent::UpsertLink { server_id, link } => format!("upsert link {}/{}", server_id, link.id),
        Intent::DeleteServer { server_id } => format!("delete server {}", server_id),
        Intent::DeleteLink { server_id, link_id } => format!("delete link {}/{}", server_id, link_id),
        Intent::Replace { config } => format!("replace ({} server groups)", config.config.len()),
    }
}

impl ManagerActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ManagerCommand>) {
        self.reconcile(None).await;

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                ManagerCommand::Submit { intent, reply } => {
                    let result = self.handle_intent(intent).await;
                    let _ = reply.send(result);
                }
                ManagerCommand::Snapshot { reply } => {
                    let _ = reply.send(self.arena.to_config());
                }
                ManagerCommand::Shutdown { reply } => {
                    self.stop_all().await;
                    let _ = reply.send(());
                    return;
                }
            }
        }

        // Every handle dropped
        self.stop_all().await;
    }

    async fn handle_intent(&mut self, mut intent: Intent) -> Result<(), ManagerError> {
        intent.normalize();
        let label = describe(&intent);
        let settings_before = self.arena.settings().clone();

        if let Err(e) = self.arena.apply(&intent) {
            warn!("Rejected intent ({}): {}", label, e);
            return Err(e.into());
        }
        info!("Applying intent: {}", label);

        if *self.arena.settings() != settings_before {
            info!("Settings changed, restarting all server groups");
            self.stop_all().await;
        }

        let retry = match &intent {
            Intent::OpenServer { server_id } => Some(server_id.as_str()),
            _ => None,
        };
        self.reconcile(retry).await;
        Ok(())
    }

    fn context(&self) -> SupervisorContext {
        SupervisorContext {
            transport: self.transport.clone(),
            credentials: self.credentials.clone(),
            ports: self.ports.clone(),
            status: self.status.clone(),
            settings: self.arena.settings().clone(),
        }
    }

    async fn reconcile(&mut self, retry: Option<&str>) {
        let groups: Vec<ServerGroup> = self
            .arena
            .servers()
            .filter_map(|record| self.arena.server_group(&record.server.id))
            .collect();

        // Stop first so restarted groups find their ports free
        let stale: Vec<String> = self
            .supervisors
            .iter()
            .filter(|(id, supervisor)| {
                !groups.iter().any(|group| {
                    &group.id == *id
                        && group.is_open
                        && group.connection_signature() == supervisor.signature()
                })
            })
            .map(|(id, _)| id.clone())
            .collect();
        let stopping: Vec<SupervisorHandle> = stale
            .iter()
            .filter_map(|id| self.supervisors.remove(id))
            .collect();
        if !stopping.is_empty() {
            debug!("Stopping {} server group(s)", stopping.len());
        }
        join_all(stopping.into_iter().map(|supervisor| supervisor.stop())).await;

        self.status
            .retain(|id| groups.iter().any(|group| group.id == id));
        self.status
            .set_order(groups.iter().map(|group| group.id.clone()).collect());

        for group in groups {
            self.status.sync_server(&group);
            if !group.is_open {
                self.status.mark_closed(&group.id, None);
                continue;
            }
            match self.supervisors.get(&group.id) {
                Some(supervisor) => {
                    let wants_retry = retry == Some(group.id.as_str());
                    supervisor.update(group);
                    if wants_retry {
                        supervisor.retry();
                    }
                }
                None => {
                    let id = group.id.clone();
                    let supervisor = spawn_supervisor(group, self.context());
                    self.supervisors.insert(id, supervisor);
                }
            }
        }
    }

    async fn stop_all(&mut self) {
        if self.supervisors.is_empty() {
            return;
        }
        info!("Stopping {} server group(s)", self.supervisors.len());
        join_all(self.supervisors.drain().map(|(_, supervisor)| supervisor.stop())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LinkGroup, Settings};
    use crate::session::{LinkState, ServerState};
    use crate::transport::mock::{echo_server, MockTransport};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::{sleep, Instant};

    fn fast_settings() -> Settings {
        Settings {
            keepalive_interval_secs: 1,
            keepalive_timeout_secs: 1,
            reconnect_initial_delay_ms: 20,
            reconnect_max_delay_ms: 100,
            reconnect_max_attempts: 3,
            channel_retry_delay_ms: 10,
            stop_grace_ms: 200,
            ..Default::default()
        }
    }

    fn server(id: &str, host: &str, links: Vec<LinkGroup>) -> ServerGroup {
        ServerGroup {
            id: id.into(),
            username: "root".into(),
            password: "secret".into(),
            server_name: format!("server {}", id),
            server_host: host.into(),
            server_port: 22,
            link_group: links,
            is_open: true,
            notes: String::new(),
            private_key_path: None,
        }
    }

    fn forward_link(id: &str, local_port: u16) -> LinkGroup {
        LinkGroup {
            id: id.into(),
            name: format!("forward {}", id),
            local_host: "127.0.0.1".into(),
            local_port,
            remote_host: "10.0.0.5".into(),
            remote_port: 80,
            notes: String::new(),
            is_penetrate: false,
            is_open: true,
        }
    }

    fn penetrate_link(id: &str, remote_port: u16, local_port: u16) -> LinkGroup {
        LinkGroup {
            id: id.into(),
            name: format!("penetrate {}", id),
            local_host: "127.0.0.1".into(),
            local_port,
            remote_host: "0.0.0.0".into(),
            remote_port,
            notes: String::new(),
            is_penetrate: true,
            is_open: true,
        }
    }

    fn config(servers: Vec<ServerGroup>) -> Config {
        Config {
            config: servers,
            settings: fast_settings(),
            ..Default::default()
        }
    }

    fn start(config: &Config, transport: &MockTransport) -> SessionManager {
        SessionManager::spawn(config, Arc::new(transport.clone())).unwrap()
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn wait_until<F>(manager: &SessionManager, what: &str, check: F)
    where
        F: Fn(&SessionManager) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check(manager) {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            sleep(Duration::from_millis(20)).await;
        }
    }

    fn server_state(manager: &SessionManager, server_id: &str) -> Option<ServerState> {
        manager.server_status(server_id).map(|s| s.state)
    }

    fn link_state(manager: &SessionManager, server_id: &str, link_id: &str) -> Option<LinkState> {
        manager
            .server_status(server_id)
            .and_then(|s| s.link(link_id).map(|l| l.state.clone()))
    }

    fn bound_port(manager: &SessionManager, server_id: &str, link_id: &str) -> u16 {
        manager
            .server_status(server_id)
            .and_then(|s| s.link(link_id).and_then(|l| l.bound_port))
            .expect("bound port")
    }

    async fn wait_link_active(manager: &SessionManager, server_id: &str, link_id: &str) {
        wait_until(manager, "link active", |m| {
            link_state(m, server_id, link_id) == Some(LinkState::Active)
        })
        .await;
    }

    async fn echo_over_tcp(port: u16, payload: &[u8]) {
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(payload).await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
            .await
            .expect("echo reply")
            .unwrap();
        assert_eq!(buf, payload);
    }

    #[tokio::test]
    async fn test_forward_link_relays() {
        let echo = echo_server().await;
        let transport = MockTransport::new();
        transport.server("h1").route("10.0.0.5", 80, echo);

        let manager = start(&config(vec![server("s1", "h1", vec![forward_link("l1", 0)])]), &transport);
        wait_link_active(&manager, "s1", "l1").await;
        assert_eq!(server_state(&manager, "s1"), Some(ServerState::Open));
        assert_eq!(manager.running_ids(), vec!["s1_l1".to_string()]);

        echo_over_tcp(bound_port(&manager, "s1", "l1"), b"hello").await;
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_penetrate_link_relays_inbound() {
        let echo = echo_server().await;
        let transport = MockTransport::new();
        let remote = transport.server("h1");

        let manager = start(
            &config(vec![server("s1", "h1", vec![penetrate_link("l1", 9000, echo.port())])]),
            &transport,
        );
        wait_link_active(&manager, "s1", "l1").await;

        let mut client = remote.connect_remote("0.0.0.0", 9000).await.unwrap();
        client.write_all(b"inbound").await.unwrap();
        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"inbound");

        manager.shutdown().await;
        assert!(!remote.has_listener("0.0.0.0", 9000));
    }

    #[tokio::test]
    async fn test_lost_connection_reopens_same_links() {
        let echo = echo_server().await;
        let transport = MockTransport::new();
        let remote = transport.server("h1");
        remote.route("10.0.0.5", 80, echo);

        let manager = start(
            &config(vec![server(
                "s1",
                "h1",
                vec![forward_link("l1", 0), penetrate_link("l2", 9100, echo.port())],
            )]),
            &transport,
        );
        wait_link_active(&manager, "s1", "l1").await;
        wait_link_active(&manager, "s1", "l2").await;
        let mut events = manager.subscribe();

        remote.kill_sessions();

        let saw_degraded = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(StatusEvent::ServerChanged {
                        state: ServerState::Degraded,
                        ..
                    }) => return true,
                    Ok(_) => {}
                    Err(_) => return false,
                }
            }
        })
        .await
        .unwrap_or(false);
        assert!(saw_degraded);

        wait_until(&manager, "reconnect", |_| remote.connects() == 2).await;
        wait_link_active(&manager, "s1", "l1").await;
        wait_link_active(&manager, "s1", "l2").await;
        assert_eq!(server_state(&manager, "s1"), Some(ServerState::Open));
        assert_eq!(remote.live_sessions(), 1);

        echo_over_tcp(bound_port(&manager, "s1", "l1"), b"again").await;
        assert!(remote.has_listener("0.0.0.0", 9100));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_closing_one_link_leaves_siblings() {
        let echo = echo_server().await;
        let transport = MockTransport::new();
        let remote = transport.server("h1");
        remote.route("10.0.0.5", 80, echo);

        let manager = start(
            &config(vec![server("s1", "h1", vec![forward_link("l1", 0), forward_link("l2", 0)])]),
            &transport,
        );
        wait_link_active(&manager, "s1", "l1").await;
        wait_link_active(&manager, "s1", "l2").await;
        let port_l2 = bound_port(&manager, "s1", "l2");

        manager
            .submit(Intent::CloseLink {
                server_id: "s1".into(),
                link_id: "l1".into(),
            })
            .await
            .unwrap();
        wait_until(&manager, "l1 inactive", |m| {
            link_state(m, "s1", "l1") == Some(LinkState::Inactive)
        })
        .await;

        assert_eq!(link_state(&manager, "s1", "l2"), Some(LinkState::Active));
        assert_eq!(bound_port(&manager, "s1", "l2"), port_l2);
        assert_eq!(remote.connects(), 1);
        echo_over_tcp(port_l2, b"still here").await;
        assert_eq!(manager.running_ids(), vec!["s1_l2".to_string()]);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_local_port_exclusive_across_groups() {
        let port = free_port();
        let transport = MockTransport::new();
        let manager = start(
            &config(vec![
                server("s1", "h1", vec![forward_link("l1", port)]),
                server("s2", "h2", vec![forward_link("l1", port)]),
            ]),
            &transport,
        );

        wait_until(&manager, "both links settled", |m| {
            let a = link_state(m, "s1", "l1");
            let b = link_state(m, "s2", "l1");
            matches!(
                (a, b),
                (Some(LinkState::Active), Some(LinkState::Error(_)))
                    | (Some(LinkState::Error(_)), Some(LinkState::Active))
            )
        })
        .await;
        assert_eq!(server_state(&manager, "s1"), Some(ServerState::Open));
        assert_eq!(server_state(&manager, "s2"), Some(ServerState::Open));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_error_does_not_affect_siblings() {
        let echo = echo_server().await;
        let transport = MockTransport::new();
        let remote = transport.server("h1");
        remote.route("10.0.0.5", 80, echo);
        remote.refuse_listen(22);

        let manager = start(
            &config(vec![server(
                "s1",
                "h1",
                vec![penetrate_link("l1", 22, echo.port()), forward_link("l2", 0)],
            )]),
            &transport,
        );
        wait_link_active(&manager, "s1", "l2").await;
        wait_until(&manager, "l1 error", |m| {
            matches!(link_state(m, "s1", "l1"), Some(LinkState::Error(_)))
        })
        .await;
        assert_eq!(server_state(&manager, "s1"), Some(ServerState::Open));

        // Not retried until its configuration changes
        sleep(Duration::from_millis(100)).await;
        assert!(matches!(link_state(&manager, "s1", "l1"), Some(LinkState::Error(_))));

        manager
            .submit(Intent::UpsertLink {
                server_id: "s1".into(),
                link: penetrate_link("l1", 2222, echo.port()),
            })
            .await
            .unwrap();
        wait_link_active(&manager, "s1", "l1").await;
        assert_eq!(remote.connects(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_repeated_open_is_idempotent() {
        let transport = MockTransport::new();
        let remote = transport.server("h1");
        let manager = start(&config(vec![server("s1", "h1", vec![forward_link("l1", 0)])]), &transport);
        wait_link_active(&manager, "s1", "l1").await;
        let port = bound_port(&manager, "s1", "l1");

        for _ in 0..2 {
            manager
                .submit(Intent::OpenServer {
                    server_id: "s1".into(),
                })
                .await
                .unwrap();
        }
        sleep(Duration::from_millis(100)).await;

        assert_eq!(remote.connects(), 1);
        assert_eq!(bound_port(&manager, "s1", "l1"), port);
        assert_eq!(link_state(&manager, "s1", "l1"), Some(LinkState::Active));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_closed_group_has_no_session() {
        let transport = MockTransport::new();
        let remote = transport.server("h1");
        let mut group = server("s1", "h1", vec![forward_link("l1", 0)]);
        group.is_open = false;

        let manager = start(&config(vec![group]), &transport);
        wait_until(&manager, "status entry", |m| m.server_status("s1").is_some()).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(server_state(&manager, "s1"), Some(ServerState::Closed));
        assert_eq!(remote.attempts(), 0);

        manager
            .submit(Intent::OpenServer {
                server_id: "s1".into(),
            })
            .await
            .unwrap();
        wait_link_active(&manager, "s1", "l1").await;
        let port = bound_port(&manager, "s1", "l1");

        manager
            .submit(Intent::CloseServer {
                server_id: "s1".into(),
            })
            .await
            .unwrap();
        assert_eq!(server_state(&manager, "s1"), Some(ServerState::Closed));
        assert_eq!(link_state(&manager, "s1", "l1"), Some(LinkState::Inactive));
        assert_eq!(remote.live_sessions(), 0);
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let transport = MockTransport::new();
        let remote = transport.server("h1");
        remote.set_reject_auth(true);

        let manager = start(&config(vec![server("s1", "h1", vec![forward_link("l1", 0)])]), &transport);
        wait_until(&manager, "auth error", |m| {
            m.server_status("s1")
                .map(|s| s.state == ServerState::Closed && s.last_error.is_some())
                .unwrap_or(false)
        })
        .await;
        let error = manager.server_status("s1").unwrap().last_error.unwrap();
        assert!(error.contains("Authentication"), "{}", error);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(remote.attempts(), 1);

        remote.set_reject_auth(false);
        manager
            .submit(Intent::OpenServer {
                server_id: "s1".into(),
            })
            .await
            .unwrap();
        wait_link_active(&manager, "s1", "l1").await;
        assert_eq!(remote.attempts(), 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_gives_up_after_reconnect_ceiling() {
        let transport = MockTransport::new();
        let remote = transport.server("h1");
        remote.set_unreachable(true);

        let manager = start(&config(vec![server("s1", "h1", vec![])]), &transport);
        wait_until(&manager, "give up", |m| {
            m.server_status("s1")
                .map(|s| {
                    s.state == ServerState::Closed
                        && s.last_error.as_deref().unwrap_or("").contains("giving up")
                })
                .unwrap_or(false)
        })
        .await;
        // First attempt plus three reconnects
        assert_eq!(remote.attempts(), 4);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_server_stops_and_removes() {
        let transport = MockTransport::new();
        let remote = transport.server("h1");
        let manager = start(&config(vec![server("s1", "h1", vec![forward_link("l1", 0)])]), &transport);
        wait_link_active(&manager, "s1", "l1").await;

        manager
            .submit(Intent::DeleteServer {
                server_id: "s1".into(),
            })
            .await
            .unwrap();
        assert!(manager.server_status("s1").is_none());
        assert!(manager.status().is_empty());
        assert_eq!(remote.live_sessions(), 0);
        assert!(manager.config().await.unwrap().config.is_empty());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_intent_changes_nothing() {
        let transport = MockTransport::new();
        let manager = start(&config(vec![server("s1", "h1", vec![])]), &transport);

        let err = manager
            .submit(Intent::OpenLink {
                server_id: "s1".into(),
                link_id: "missing".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::Config(ConfigError::LinkNotFound { .. })));
        assert_eq!(manager.config().await.unwrap().config.len(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_connection_change_restarts_group() {
        let transport = MockTransport::new();
        let first = transport.server("h1");
        let second = transport.server("h2");
        let manager = start(&config(vec![server("s1", "h1", vec![forward_link("l1", 0)])]), &transport);
        wait_link_active(&manager, "s1", "l1").await;

        manager
            .submit(Intent::UpsertServer {
                server: server("s1", "h2", vec![forward_link("l1", 0)]),
            })
            .await
            .unwrap();
        wait_until(&manager, "moved to h2", |_| second.connects() == 1).await;
        wait_link_active(&manager, "s1", "l1").await;
        assert_eq!(first.live_sessions(), 0);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let transport = MockTransport::new();
        let remote = transport.server("h1");
        let manager = start(&config(vec![server("s1", "h1", vec![forward_link("l1", 0)])]), &transport);
        wait_link_active(&manager, "s1", "l1").await;
        let port = bound_port(&manager, "s1", "l1");

        manager.shutdown().await;
        assert_eq!(remote.live_sessions(), 0);
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
        assert_eq!(
            manager
                .submit(Intent::OpenServer {
                    server_id: "s1".into()
                })
                .await,
            Err(ManagerError::Stopped)
        );
    }

    #[tokio::test]
    async fn test_duplicate_remote_address_keeps_first_link() {
        let echo = echo_server().await;
        let transport = MockTransport::new();
        let remote = transport.server("h1");

        let manager = start(
            &config(vec![server(
                "s1",
                "h1",
                vec![
                    penetrate_link("l1", 9400, echo.port()),
                    penetrate_link("l2", 9400, echo.port()),
                ],
            )]),
            &transport,
        );
        wait_link_active(&manager, "s1", "l1").await;
        wait_until(&manager, "l2 error", |m| {
            matches!(link_state(m, "s1", "l2"), Some(LinkState::Error(_)))
        })
        .await;

        sleep(Duration::from_millis(100)).await;
        assert_eq!(link_state(&manager, "s1", "l1"), Some(LinkState::Active));
        assert_eq!(server_state(&manager, "s1"), Some(ServerState::Open));

        let mut client = remote.connect_remote("0.0.0.0", 9400).await.unwrap();
        client.write_all(b"first").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"first");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_replacing_with_same_snapshot_is_idempotent() {
        let echo = echo_server().await;
        let transport = MockTransport::new();
        let remote = transport.server("h1");
        remote.route("10.0.0.5", 80, echo);

        let snapshot = config(vec![server(
            "s1",
            "h1",
            vec![forward_link("l1", 0), penetrate_link("l2", 9500, echo.port())],
        )]);
        let manager = start(&snapshot, &transport);
        wait_link_active(&manager, "s1", "l1").await;
        wait_link_active(&manager, "s1", "l2").await;
        let port = bound_port(&manager, "s1", "l1");

        for _ in 0..2 {
            manager
                .submit(Intent::Replace {
                    config: snapshot.clone(),
                })
                .await
                .unwrap();
        }
        sleep(Duration::from_millis(100)).await;

        assert_eq!(remote.connects(), 1);
        assert_eq!(bound_port(&manager, "s1", "l1"), port);
        assert_eq!(link_state(&manager, "s1", "l1"), Some(LinkState::Active));
        assert_eq!(link_state(&manager, "s1", "l2"), Some(LinkState::Active));
        assert_eq!(
            manager.running_ids(),
            vec!["s1_l1".to_string(), "s1_l2".to_string()]
        );
        echo_over_tcp(port, b"unchanged").await;
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_settings_change_restarts_groups() {
        let transport = MockTransport::new();
        let remote = transport.server("h1");
        let manager = start(&config(vec![server("s1", "h1", vec![forward_link("l1", 0)])]), &transport);
        wait_link_active(&manager, "s1", "l1").await;

        let mut changed = manager.config().await.unwrap();
        changed.settings.idle_timeout_secs += 60;
        manager
            .submit(Intent::Replace { config: changed })
            .await
            .unwrap();

        wait_until(&manager, "reconnect", |_| remote.connects() == 2).await;
        wait_link_active(&manager, "s1", "l1").await;
        assert_eq!(remote.live_sessions(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_link_edit_restarts_only_that_forwarder() {
        let echo = echo_server().await;
        let transport = MockTransport::new();
        let remote = transport.server("h1");
        remote.route("10.0.0.5", 80, echo);
        remote.route("10.0.0.5", 81, echo);

        let manager = start(
            &config(vec![server("s1", "h1", vec![forward_link("l1", 0), forward_link("l2", 0)])]),
            &transport,
        );
        wait_link_active(&manager, "s1", "l1").await;
        wait_link_active(&manager, "s1", "l2").await;
        let port_l2 = bound_port(&manager, "s1", "l2");

        let new_port = free_port();
        let mut edited = forward_link("l1", new_port);
        edited.remote_port = 81;
        manager
            .submit(Intent::UpsertLink {
                server_id: "s1".into(),
                link: edited,
            })
            .await
            .unwrap();
        wait_until(&manager, "l1 on its new port", |m| {
            m.server_status("s1")
                .and_then(|s| s.link("l1").and_then(|l| l.bound_port))
                == Some(new_port)
        })
        .await;

        assert_eq!(link_state(&manager, "s1", "l1"), Some(LinkState::Active));
        assert_eq!(link_state(&manager, "s1", "l2"), Some(LinkState::Active));
        assert_eq!(bound_port(&manager, "s1", "l2"), port_l2);
        assert_eq!(remote.connects(), 1);
        echo_over_tcp(new_port, b"edited").await;
        echo_over_tcp(port_l2, b"untouched").await;
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_lost_session_leaves_penetrate_link_inactive() {
        let echo = echo_server().await;
        let transport = MockTransport::new();
        let remote = transport.server("h1");

        let manager = start(
            &config(vec![server("s1", "h1", vec![penetrate_link("l1", 9600, echo.port())])]),
            &transport,
        );
        wait_link_active(&manager, "s1", "l1").await;
        let mut events = manager.subscribe();

        remote.kill_sessions();
        wait_until(&manager, "reconnect", |_| remote.connects() == 2).await;
        wait_link_active(&manager, "s1", "l1").await;

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let StatusEvent::LinkChanged { link_id, state, .. } = event {
                if link_id == "l1" {
                    states.push(state);
                }
            }
        }
        assert!(states.contains(&LinkState::Inactive), "{:?}", states);
        assert!(
            !states.iter().any(|s| matches!(s, LinkState::Error(_))),
            "{:?}",
            states
        );
        manager.shutdown().await;
    }
}
