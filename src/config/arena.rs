//! Id-indexed read model of the configuration tree
//!
//! Server groups and link groups live in separate maps keyed by id. A link
//! record knows its owner only by id, and each server keeps the ordered list of
//! its link ids so iteration follows the configuration sequence.

use std::collections::{HashMap, HashSet};

use super::error::ConfigError;
use super::intent::Intent;
use super::settings::Settings;
use super::types::{Config, LinkGroup, ServerGroup, CONFIG_VERSION};

/// Server group fields without the nested links
#[derive(Debug, Clone, PartialEq)]
pub struct ServerRecord {
    /// Server group with an empty `link_group`
    pub server: ServerGroup,
    /// Link ids in configuration order
    pub link_ids: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigArena {
    servers: HashMap<String, ServerRecord>,
    order: Vec<String>,
    links: HashMap<(String, String), LinkGroup>,
    is_dark: bool,
    is_english: bool,
    settings: Settings,
}

fn invalid_server(server: &ServerGroup, reason: &str) -> ConfigError {
    ConfigError::InvalidServer {
        id: server.id.clone(),
        reason: reason.to_string(),
    }
}

fn invalid_link(link: &LinkGroup, reason: &str) -> ConfigError {
    ConfigError::InvalidLink {
        id: link.id.clone(),
        reason: reason.to_string(),
    }
}

/// Check a link group in isolation
pub fn validate_link(link: &LinkGroup) -> Result<(), ConfigError> {
    if link.id.trim().is_empty() {
        return Err(invalid_link(link, "missing id"));
    }
    if link.local_host.trim().is_empty() {
        return Err(invalid_link(link, "local_host is empty"));
    }
    if link.remote_host.trim().is_empty() {
        return Err(invalid_link(link, "remote_host is empty"));
    }
    // Port 0 is only meaningful on the listening side
    if link.is_penetrate && link.local_port == 0 {
        return Err(invalid_link(link, "local_port must be set in penetrate mode"));
    }
    if !link.is_penetrate && link.remote_port == 0 {
        return Err(invalid_link(link, "remote_port must be set in forward mode"));
    }
    Ok(())
}

/// Check a server group and its nested links
pub fn validate_server(server: &ServerGroup) -> Result<(), ConfigError> {
    if server.id.trim().is_empty() {
        return Err(invalid_server(server, "missing id"));
    }
    if server.server_host.trim().is_empty() {
        return Err(invalid_server(server, "server_host is empty"));
    }
    if server.server_port == 0 {
        return Err(invalid_server(server, "server_port must be non-zero"));
    }
    if server.username.trim().is_empty() {
        return Err(invalid_server(server, "username is empty"));
    }

    let mut seen = HashSet::new();
    for link in &server.link_group {
        validate_link(link)?;
        if !seen.insert(link.id.as_str()) {
            return Err(ConfigError::DuplicateLink {
                server_id: server.id.clone(),
                link_id: link.id.clone(),
            });
        }
    }
    Ok(())
}

impl ConfigArena {
    /// Build the arena from a configuration tree, validating every record
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        if config.version > CONFIG_VERSION {
            return Err(ConfigError::VersionTooNew {
                found: config.version,
                supported: CONFIG_VERSION,
            });
        }

        let mut arena = ConfigArena {
            is_dark: config.is_dark,
            is_english: config.is_english,
            settings: config.settings.clone(),
            ..Default::default()
        };

        for server in &config.config {
            validate_server(server)?;
            if arena.servers.contains_key(&server.id) {
                return Err(ConfigError::DuplicateServer(server.id.clone()));
            }
            arena.insert_server(server.clone());
        }
        Ok(arena)
    }

    /// Materialize the configuration tree
    pub fn to_config(&self) -> Config {
        Config {
            version: CONFIG_VERSION,
            config: self
                .order
                .iter()
                .filter_map(|id| self.server_group(id))
                .collect(),
            is_dark: self.is_dark,
            is_english: self.is_english,
            settings: self.settings.clone(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn server(&self, id: &str) -> Option<&ServerRecord> {
        self.servers.get(id)
    }

    pub fn link(&self, server_id: &str, link_id: &str) -> Option<&LinkGroup> {
        self.links.get(&(server_id.to_string(), link_id.to_string()))
    }

    /// Server records in configuration order
    pub fn servers(&self) -> impl Iterator<Item = &ServerRecord> {
        self.order.iter().filter_map(|id| self.servers.get(id))
    }

    /// Link groups of one server in configuration order
    pub fn links_of<'a>(&'a self, server_id: &'a str) -> impl Iterator<Item = &'a LinkGroup> + 'a {
        self.servers
            .get(server_id)
            .into_iter()
            .flat_map(|record| record.link_ids.iter())
            .filter_map(move |link_id| self.links.get(&(server_id.to_string(), link_id.clone())))
    }

    /// Server group with its links, as it appears in the configuration tree
    pub fn server_group(&self, id: &str) -> Option<ServerGroup> {
        let record = self.servers.get(id)?;
        let mut server = record.server.clone();
        server.link_group = self.links_of(id).cloned().collect();
        Some(server)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Apply an intent. Nothing is modified when an error is returned.
    pub fn apply(&mut self, intent: &Intent) -> Result<(), ConfigError> {
        match intent {
            Intent::OpenServer { server_id } => self.set_server_open(server_id, true),
            Intent::CloseServer { server_id } => self.set_server_open(server_id, false),
            Intent::OpenLink { server_id, link_id } => self.set_link_open(server_id, link_id, true),
            Intent::CloseLink { server_id, link_id } => {
                self.set_link_open(server_id, link_id, false)
            }
            Intent::UpsertServer { server } => {
                validate_server(server)?;
                self.upsert_server(server.clone());
                Ok(())
            }
            Intent::UpsertLink { server_id, link } => {
                validate_link(link)?;
                self.upsert_link(server_id, link.clone())
            }
            Intent::DeleteServer { server_id } => {
                if !self.servers.contains_key(server_id) {
                    return Err(ConfigError::ServerNotFound(server_id.clone()));
                }
                self.remove_server(server_id);
                Ok(())
            }
            Intent::DeleteLink { server_id, link_id } => self.remove_link(server_id, link_id),
            Intent::Replace { config } => {
                *self = ConfigArena::from_config(config)?;
                Ok(())
            }
        }
    }

    fn insert_server(&mut self, mut server: ServerGroup) {
        let links = std::mem::take(&mut server.link_group);
        let id = server.id.clone();
        let link_ids = links.iter().map(|l| l.id.clone()).collect();
        for link in links {
            self.links.insert((id.clone(), link.id.clone()), link);
        }
        if !self.servers.contains_key(&id) {
            self.order.push(id.clone());
        }
        self.servers.insert(id, ServerRecord { server, link_ids });
    }

    fn upsert_server(&mut self, server: ServerGroup) {
        if let Some(old) = self.servers.get(&server.id) {
            let stale: Vec<String> = old.link_ids.clone();
            for link_id in stale {
                self.links.remove(&(server.id.clone(), link_id));
            }
        }
        self.insert_server(server);
    }

    fn remove_server(&mut self, server_id: &str) {
        if let Some(record) = self.servers.remove(server_id) {
            for link_id in record.link_ids {
                self.links.remove(&(server_id.to_string(), link_id));
            }
        }
        self.order.retain(|id| id != server_id);
    }

    fn set_server_open(&mut self, server_id: &str, open: bool) -> Result<(), ConfigError> {
        let record = self
            .servers
            .get_mut(server_id)
            .ok_or_else(|| ConfigError::ServerNotFound(server_id.to_string()))?;
        record.server.is_open = open;
        Ok(())
    }

    fn link_mut(&mut self, server_id: &str, link_id: &str) -> Result<&mut LinkGroup, ConfigError> {
        if !self.servers.contains_key(server_id) {
            return Err(ConfigError::ServerNotFound(server_id.to_string()));
        }
        self.links
            .get_mut(&(server_id.to_string(), link_id.to_string()))
            .ok_or_else(|| ConfigError::LinkNotFound {
                server_id: server_id.to_string(),
                link_id: link_id.to_string(),
            })
    }

    fn set_link_open(&mut self, server_id: &str, link_id: &str, open: bool) -> Result<(), ConfigError> {
        self.link_mut(server_id, link_id)?.is_open = open;
        Ok(())
    }

    fn upsert_link(&mut self, server_id: &str, link: LinkGroup) -> Result<(), ConfigError> {
        let record = self
            .servers
            .get_mut(server_id)
            .ok_or_else(|| ConfigError::ServerNotFound(server_id.to_string()))?;
        if !record.link_ids.contains(&link.id) {
            record.link_ids.push(link.id.clone());
        }
        self.links
            .insert((server_id.to_string(), link.id.clone()), link);
        Ok(())
    }

    fn remove_link(&mut self, server_id: &str, link_id: &str) -> Result<(), ConfigError> {
        self.link_mut(server_id, link_id)?;
        self.links
            .remove(&(server_id.to_string(), link_id.to_string()));
        if let Some(record) = self.servers.get_mut(server_id) {
            record.link_ids.retain(|id| id != link_id);
        }
        Ok(())
    }
}
