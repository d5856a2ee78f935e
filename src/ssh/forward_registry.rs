//! Routing of server-opened `forwarded-tcpip` channels
//!
//! Each SSH connection has its own registry mapping the (address, port) the
//! server listens on to the penetrate forwarder that requested it. The
//! `ClientHandler` looks the pair up when the server reports an inbound
//! connection.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::error::SshError;
use crate::transport::InboundConnection;

#[derive(Default)]
pub struct RemoteForwardRegistry {
    forwards: DashMap<(String, u32), mpsc::Sender<InboundConnection>>,
}

impl RemoteForwardRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim `address:port` for `tx`. Fails while another forwarder on
    /// this connection holds the same pair.
    pub fn register(
        &self,
        address: &str,
        port: u32,
        tx: &mpsc::Sender<InboundConnection>,
    ) -> Result<(), SshError> {
        match self.forwards.entry((address.to_string(), port)) {
            Entry::Occupied(_) => Err(SshError::BindFailed(format!(
                "{}:{} is already forwarded on this connection",
                address, port
            ))),
            Entry::Vacant(slot) => {
                slot.insert(tx.clone());
                debug!("Registered remote forward {}:{}", address, port);
                Ok(())
            }
        }
    }

    /// Drop the registration for `address:port` if it still belongs to `tx`
    pub fn unregister(&self, address: &str, port: u32, tx: &mpsc::Sender<InboundConnection>) {
        let key = (address.to_string(), port);
        if self
            .forwards
            .remove_if(&key, |_, owner| owner.same_channel(tx))
            .is_some()
        {
            debug!("Unregistered remote forward {}:{}", address, port);
        }
    }

    /// Move a registration after the server picked a port for a port-0 request
    pub fn rebind(
        &self,
        address: &str,
        requested: u32,
        bound: u32,
        tx: &mpsc::Sender<InboundConnection>,
    ) -> Result<(), SshError> {
        if requested == bound {
            return Ok(());
        }
        self.unregister(address, requested, tx);
        self.register(address, bound, tx)
    }

    pub fn lookup(&self, address: &str, port: u32) -> Option<mpsc::Sender<InboundConnection>> {
        self.forwards
            .get(&(address.to_string(), port))
            .map(|entry| entry.value().clone())
    }

    /// Hand an inbound connection to its forwarder, dropping it when nobody listens
    pub fn dispatch(&self, address: &str, port: u32, connection: InboundConnection) -> bool {
        let Some(tx) = self.lookup(address, port) else {
            warn!("No registered forward for {}:{}, dropping channel", address, port);
            return false;
        };
        match tx.try_send(connection) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Forward {}:{} backlog full, dropping channel", address, port);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.unregister(address, port, &tx);
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.forwards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forwards.is_empty()
    }
}
