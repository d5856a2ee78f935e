//! Process-wide local port bookkeeping
//!
//! A local port is claimed by at most one forward-mode link at a time. Two
//! claims conflict when the ports match and either host is a wildcard or
//! both hosts are equal. Port 0 asks the OS for a free port and never
//! conflicts.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ssh::SshError;

#[derive(Debug, Clone, Default)]
pub struct PortRegistry {
    claims: Arc<Mutex<HashMap<(String, u16), String>>>,
}

fn is_wildcard(host: &str) -> bool {
    matches!(host, "" | "0.0.0.0" | "::" | "[::]" | "*")
}

fn normalize(host: &str) -> String {
    if host.eq_ignore_ascii_case("localhost") {
        "127.0.0.1".to_string()
    } else {
        host.to_string()
    }
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `host:port` for `owner` until the returned claim is dropped
    pub fn claim(&self, host: &str, port: u16, owner: &str) -> Result<PortClaim, SshError> {
        if port == 0 {
            return Ok(PortClaim {
                registry: self.clone(),
                key: None,
            });
        }

        let host = normalize(host);
        let mut claims = self.claims.lock();
        let conflict = claims.iter().find(|((claimed_host, claimed_port), _)| {
            *claimed_port == port
                && (is_wildcard(claimed_host) || is_wildcard(&host) || *claimed_host == host)
        });
        if let Some((_, holder)) = conflict {
            return Err(SshError::BindFailed(format!(
                "local port {} is already used by {}",
                port, holder
            )));
        }

        let key = (host, port);
        claims.insert(key.clone(), owner.to_string());
        Ok(PortClaim {
            registry: self.clone(),
            key: Some(key),
        })
    }

    pub fn is_claimed(&self, host: &str, port: u16) -> bool {
        self.claims.lock().contains_key(&(normalize(host), port))
    }

    pub fn len(&self) -> usize {
        self.claims.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// RAII reservation handed out by [`PortRegistry::claim`]
#[derive(Debug)]
pub struct PortClaim {
    registry: PortRegistry,
    key: Option<(String, u16)>,
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.registry.claims.lock().remove(&key);
        }
    }
}
