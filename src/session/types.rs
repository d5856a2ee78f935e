//! Session status types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{LinkGroup, ServerGroup};
use crate::forwarding::{ForwardMode, ForwardStats};

/// Server group lifecycle: closed -> connecting -> open -> degraded -> ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Closed,
    Connecting,
    Open,
    /// Connection lost, reconnecting with backoff
    Degraded,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Closed => write!(f, "closed"),
            ServerState::Connecting => write!(f, "connecting"),
            ServerState::Open => write!(f, "open"),
            ServerState::Degraded => write!(f, "degraded"),
        }
    }
}

/// Health of the transport session behind a server group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionHealth {
    Connecting,
    Healthy,
    /// Probes are failing but the threshold has not been reached
    Degraded,
    #[default]
    Dead,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum LinkState {
    Active,
    #[default]
    Inactive,
    Error(String),
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Active => write!(f, "active"),
            LinkState::Inactive => write!(f, "inactive"),
            LinkState::Error(reason) => write!(f, "error:{}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub link_id: String,
    pub name: String,
    pub mode: ForwardMode,
    pub state: LinkState,
    /// Listening port while active
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bound_port: Option<u16>,
    pub stats: ForwardStats,
}

impl LinkStatus {
    pub fn from_link(link: &LinkGroup) -> Self {
        Self {
            link_id: link.id.clone(),
            name: link.display_name().to_string(),
            mode: if link.is_penetrate {
                ForwardMode::Penetrate
            } else {
                ForwardMode::Forward
            },
            state: LinkState::Inactive,
            bound_port: None,
            stats: ForwardStats::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub server_id: String,
    pub name: String,
    pub state: ServerState,
    pub health: SessionHealth,
    /// Consecutive missed keep-alive probes
    pub missed_probes: u32,
    /// Current reconnect attempt, 0 when not reconnecting
    pub reconnect_attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub links: Vec<LinkStatus>,
    pub updated_at: DateTime<Utc>,
}

impl ServerStatus {
    pub fn from_group(group: &ServerGroup) -> Self {
        Self {
            server_id: group.id.clone(),
            name: group.display_name().to_string(),
            state: ServerState::Closed,
            health: SessionHealth::Dead,
            missed_probes: 0,
            reconnect_attempt: 0,
            last_error: None,
            links: group.link_group.iter().map(LinkStatus::from_link).collect(),
            updated_at: Utc::now(),
        }
    }

    pub fn link(&self, link_id: &str) -> Option<&LinkStatus> {
        self.links.iter().find(|l| l.link_id == link_id)
    }

    pub(crate) fn link_mut(&mut self, link_id: &str) -> Option<&mut LinkStatus> {
        self.links.iter_mut().find(|l| l.link_id == link_id)
    }
}
