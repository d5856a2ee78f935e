//! Configuration intents
//!
//! Discrete mutations of the configuration tree. The same intent is applied to
//! the persisted store and submitted to the session manager, so ids must be
//! assigned once (see [`Intent::normalize`]) before it is handed to either.

use serde::{Deserialize, Serialize};

use super::types::{Config, LinkGroup, ServerGroup};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Intent {
    OpenServer { server_id: String },
    CloseServer { server_id: String },
    OpenLink { server_id: String, link_id: String },
    CloseLink { server_id: String, link_id: String },
    /// Insert a server group, or replace it (links included) when the id exists
    UpsertServer { server: ServerGroup },
    /// Append a link group, or replace it in place when the id exists
    UpsertLink { server_id: String, link: LinkGroup },
    DeleteServer { server_id: String },
    DeleteLink { server_id: String, link_id: String },
    /// Full snapshot, e.g. after the file was edited on disk
    Replace { config: Config },
}

fn assign_id(id: &mut String) {
    if id.trim().is_empty() {
        *id = uuid::Uuid::new_v4().to_string();
    }
}

fn normalize_server(server: &mut ServerGroup) {
    assign_id(&mut server.id);
    for link in &mut server.link_group {
        assign_id(&mut link.id);
    }
}

impl Intent {
    /// Fill in missing ids for records created by this intent
    pub fn normalize(&mut self) {
        match self {
            Intent::UpsertServer { server } => normalize_server(server),
            Intent::UpsertLink { link, .. } => assign_id(&mut link.id),
            Intent::Replace { config } => {
                for server in &mut config.config {
                    normalize_server(server);
                }
            }
            _ => {}
        }
    }

    /// Server group affected by this intent, `None` for full replacements
    pub fn server_id(&self) -> Option<&str> {
        match self {
            Intent::OpenServer { server_id }
            | Intent::CloseServer { server_id }
            | Intent::OpenLink { server_id, .. }
            | Intent::CloseLink { server_id, .. }
            | Intent::UpsertLink { server_id, .. }
            | Intent::DeleteServer { server_id }
            | Intent::DeleteLink { server_id, .. } => Some(server_id),
            Intent::UpsertServer { server } => Some(&server.id),
            Intent::Replace { .. } => None,
        }
    }
}
