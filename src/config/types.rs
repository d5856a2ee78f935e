//! Persisted configuration types
//!
//! Field names match the JSON files written by earlier releases of the tool,
//! so existing configuration files load without conversion.

use serde::{Deserialize, Serialize};

use super::settings::Settings;

/// Current configuration schema version
pub const CONFIG_VERSION: u32 = 1;

fn default_version() -> u32 {
    CONFIG_VERSION
}

fn default_true() -> bool {
    true
}

fn default_ssh_port() -> u16 {
    22
}

/// Root configuration object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Schema version
    #[serde(default = "default_version")]
    pub version: u32,

    /// Server groups in display order
    #[serde(default)]
    pub config: Vec<ServerGroup>,

    /// Presentation flag, persisted but never consumed by the core
    #[serde(default = "default_true")]
    pub is_dark: bool,

    /// Presentation flag, persisted but never consumed by the core
    #[serde(default = "default_true")]
    pub is_english: bool,

    /// Runtime tunables (omitted while equal to the defaults)
    #[serde(default, skip_serializing_if = "Settings::is_default")]
    pub settings: Settings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            config: Vec::new(),
            is_dark: true,
            is_english: true,
            settings: Settings::default(),
        }
    }
}

impl Config {
    /// Find a server group by id
    pub fn server(&self, id: &str) -> Option<&ServerGroup> {
        self.config.iter().find(|s| s.id == id)
    }
}

/// One remote host plus credentials, owning an ordered set of forwarding rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerGroup {
    #[serde(default)]
    pub id: String,

    pub username: String,

    /// Password, or passphrase for `private_key_path` when that is set
    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub server_name: String,

    pub server_host: String,

    #[serde(default = "default_ssh_port")]
    pub server_port: u16,

    #[serde(default)]
    pub link_group: Vec<LinkGroup>,

    /// Desired connection state
    #[serde(default)]
    pub is_open: bool,

    #[serde(default)]
    pub notes: String,

    /// Optional private key used instead of password authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,
}

impl ServerGroup {
    /// Human readable name for logs, falling back to the host
    pub fn display_name(&self) -> &str {
        if self.server_name.is_empty() {
            &self.server_host
        } else {
            &self.server_name
        }
    }

    /// Fields that require a new transport session when they change
    pub fn connection_signature(&self) -> String {
        format!(
            "{}:{}@{}:{}|{}",
            self.username,
            self.password,
            self.server_host,
            self.server_port,
            self.private_key_path.as_deref().unwrap_or("")
        )
    }

    pub fn link(&self, link_id: &str) -> Option<&LinkGroup> {
        self.link_group.iter().find(|l| l.id == link_id)
    }
}

/// One forwarding rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkGroup {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub name: String,

    pub local_host: String,

    pub remote_host: String,

    pub remote_port: u16,

    pub local_port: u16,

    #[serde(default)]
    pub notes: String,

    /// Reverse mode: the remote peer listens and connections are relayed to the local target
    #[serde(default)]
    pub is_penetrate: bool,

    /// Desired forwarding state
    #[serde(default)]
    pub is_open: bool,
}

impl LinkGroup {
    /// Fields that require restarting the forwarder when they change
    pub fn forward_signature(&self) -> String {
        format!(
            "{}|{}:{}->{}:{}",
            self.is_penetrate, self.local_host, self.local_port, self.remote_host, self.remote_port
        )
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEGACY_FILE: &str = r#"{
      "config": [
        {
          "id": "s1",
          "username": "root",
          "password": "hunter2",
          "server_name": "edge",
          "server_host": "10.0.0.1",
          "server_port": 22,
          "link_group": [
            {
              "id": "l1",
              "name": "web",
              "local_host": "127.0.0.1",
              "remote_host": "10.0.0.5",
              "remote_port": 80,
              "local_port": 8080,
              "notes": "",
              "is_penetrate": false,
              "is_open": true
            }
          ],
          "is_open": true,
          "notes": ""
        }
      ],
      "is_dark": false,
      "is_english": true
    }"#;

    #[test]
    fn test_load_legacy_file() {
        let config: Config = serde_json::from_str(LEGACY_FILE).unwrap();
        assert_eq!(config.version, CONFIG_VERSION);
        assert!(!config.is_dark);
        assert_eq!(config.settings, Settings::default());

        let server = config.server("s1").unwrap();
        assert_eq!(server.display_name(), "edge");
        assert!(server.private_key_path.is_none());
        assert_eq!(server.link_group[0].local_port, 8080);
    }

    #[test]
    fn test_default_settings_not_serialized() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("settings"));
        assert!(!json.contains("private_key_path"));
        assert!(json.contains("\"is_dark\":true"));
    }

    #[test]
    fn test_forward_signature_tracks_mode() {
        let config: Config = serde_json::from_str(LEGACY_FILE).unwrap();
        let mut link = config.config[0].link_group[0].clone();
        let before = link.forward_signature();
        assert_eq!(before, "false|127.0.0.1:8080->10.0.0.5:80");

        // Renaming does not change the signature
        link.name = "renamed".into();
        assert_eq!(link.forward_signature(), before);

        link.is_penetrate = true;
        assert_ne!(link.forward_signature(), before);
    }

    #[test]
    fn test_connection_signature_ignores_links() {
        let config: Config = serde_json::from_str(LEGACY_FILE).unwrap();
        let mut server = config.config[0].clone();
        let before = server.connection_signature();
        server.link_group.clear();
        server.is_open = false;
        assert_eq!(server.connection_signature(), before);

        server.password = "changed".into();
        assert_ne!(server.connection_signature(), before);
    }
}
