//! Status board
//!
//! Thread-safe view of every server group and link, kept in configuration
//! order. Writers go through [`StatusBoard::update`], which diffs the entry
//! and broadcasts one event per observable change.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use super::types::{LinkState, LinkStatus, ServerState, ServerStatus, SessionHealth};
use crate::config::ServerGroup;
use crate::forwarding::ForwardStats;

const EVENT_CAPACITY: usize = 256;

/// Change notifications for status subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StatusEvent {
    ServerChanged {
        server_id: String,
        state: ServerState,
        health: SessionHealth,
        missed_probes: u32,
        reconnect_attempt: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    LinkChanged {
        server_id: String,
        link_id: String,
        state: LinkState,
    },
    /// Throttled, published on the stats interval only when counters moved
    LinkStats {
        server_id: String,
        link_id: String,
        stats: ForwardStats,
    },
    ServerRemoved { server_id: String },
}

pub struct StatusBoard {
    servers: DashMap<String, ServerStatus>,
    order: RwLock<Vec<String>>,
    events: broadcast::Sender<StatusEvent>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

fn diff(before: &ServerStatus, after: &ServerStatus) -> Vec<StatusEvent> {
    let mut events = Vec::new();
    if before.state != after.state
        || before.health != after.health
        || before.missed_probes != after.missed_probes
        || before.reconnect_attempt != after.reconnect_attempt
        || before.last_error != after.last_error
    {
        events.push(StatusEvent::ServerChanged {
            server_id: after.server_id.clone(),
            state: after.state,
            health: after.health,
            missed_probes: after.missed_probes,
            reconnect_attempt: after.reconnect_attempt,
            error: after.last_error.clone(),
        });
    }
    for link in &after.links {
        let previous = before.link(&link.link_id);
        if previous.map(|p| &p.state) != Some(&link.state) {
            events.push(StatusEvent::LinkChanged {
                server_id: after.server_id.clone(),
                link_id: link.link_id.clone(),
                state: link.state.clone(),
            });
        }
        if previous.map(|p| &p.stats) != Some(&link.stats) {
            events.push(StatusEvent::LinkStats {
                server_id: after.server_id.clone(),
                link_id: link.link_id.clone(),
                stats: link.stats.clone(),
            });
        }
    }
    events
}

impl StatusBoard {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            servers: DashMap::new(),
            order: RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, server_id: &str) -> Option<ServerStatus> {
        self.servers.get(server_id).map(|entry| entry.clone())
    }

    /// Every server group in configuration order
    pub fn snapshot(&self) -> Vec<ServerStatus> {
        self.order
            .read()
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.order.read().clone()
    }

    /// `serverId_linkId` for every active link
    pub fn active_link_ids(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .flat_map(|server| {
                server
                    .links
                    .iter()
                    .filter(|link| link.state == LinkState::Active)
                    .map(move |link| format!("{}_{}", server.server_id, link.link_id))
            })
            .collect()
    }

    pub(crate) fn set_order(&self, order: Vec<String>) {
        *self.order.write() = order;
    }

    /// Create or refresh the entry for `group`. Known links keep their
    /// state, new links start inactive, removed links disappear.
    pub(crate) fn sync_server(&self, group: &ServerGroup) {
        let mut entry = self
            .servers
            .entry(group.id.clone())
            .or_insert_with(|| ServerStatus::from_group(group));
        entry.name = group.display_name().to_string();
        let links = group
            .link_group
            .iter()
            .map(|link| {
                let mut status = LinkStatus::from_link(link);
                if let Some(existing) = entry.link(&link.id) {
                    status.state = existing.state.clone();
                    status.bound_port = existing.bound_port;
                    status.stats = existing.stats.clone();
                }
                status
            })
            .collect();
        entry.links = links;
    }

    /// Mutate one entry and publish what changed
    pub(crate) fn update<F>(&self, server_id: &str, f: F)
    where
        F: FnOnce(&mut ServerStatus),
    {
        let events = {
            let Some(mut entry) = self.servers.get_mut(server_id) else {
                return;
            };
            let before = entry.clone();
            f(entry.value_mut());
            let events = diff(&before, entry.value());
            if !events.is_empty() {
                entry.updated_at = Utc::now();
            }
            events
        };
        for event in events {
            if self.events.send(event).is_err() {
                debug!("No status subscribers");
                break;
            }
        }
    }

    pub(crate) fn set_link(&self, server_id: &str, link_id: &str, state: LinkState, bound_port: Option<u16>) {
        self.update(server_id, |status| {
            if let Some(link) = status.link_mut(link_id) {
                link.state = state;
                link.bound_port = bound_port;
            }
        });
    }

    /// Closed group: no session, every link inactive
    pub(crate) fn mark_closed(&self, server_id: &str, error: Option<String>) {
        self.update(server_id, |status| {
            status.state = ServerState::Closed;
            status.health = SessionHealth::Dead;
            status.missed_probes = 0;
            status.last_error = error;
            for link in &mut status.links {
                link.state = LinkState::Inactive;
                link.bound_port = None;
            }
        });
    }

    /// Drop every entry whose id fails `keep`
    pub(crate) fn retain<F: Fn(&str) -> bool>(&self, keep: F) {
        let stale: Vec<String> = self
            .servers
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| !keep(id))
            .collect();
        for id in stale {
            self.remove(&id);
        }
    }

    pub(crate) fn remove(&self, server_id: &str) {
        if self.servers.remove(server_id).is_some() {
            let _ = self.events.send(StatusEvent::ServerRemoved {
                server_id: server_id.to_string(),
            });
        }
    }
}
