//! Forward Event System
//!
//! Forwarders report link-level conditions that the owning supervisor turns
//! into link status. Events travel over an unbounded channel so a busy
//! connection task never blocks on the supervisor.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events raised by a running forwarder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ForwardEvent {
    /// Channel setup failed after exhausting retries
    ChannelFailed {
        server_id: String,
        link_id: String,
        instance: u64,
        error: String,
    },
    /// A channel opened again after failures
    ChannelRecovered {
        server_id: String,
        link_id: String,
        instance: u64,
    },
    /// The listener went away underneath the forwarder
    ListenerClosed {
        server_id: String,
        link_id: String,
        instance: u64,
        reason: String,
    },
}

impl ForwardEvent {
    pub fn link_id(&self) -> &str {
        match self {
            ForwardEvent::ChannelFailed { link_id, .. }
            | ForwardEvent::ChannelRecovered { link_id, .. }
            | ForwardEvent::ListenerClosed { link_id, .. } => link_id,
        }
    }

    /// Forwarder instance that raised the event
    pub fn instance(&self) -> u64 {
        match self {
            ForwardEvent::ChannelFailed { instance, .. }
            | ForwardEvent::ChannelRecovered { instance, .. }
            | ForwardEvent::ListenerClosed { instance, .. } => *instance,
        }
    }
}

/// Event emitter for forwarders of one server group
///
/// Each started forwarder gets its own copy tagged with an instance number,
/// so events from a stopped forwarder can be told apart from its successor.
/// Can be a no-op for tests or when nobody listens.
#[derive(Clone)]
pub struct ForwardEventEmitter {
    tx: Option<mpsc::UnboundedSender<ForwardEvent>>,
    server_id: String,
    instance: u64,
}

impl ForwardEventEmitter {
    pub fn new(tx: mpsc::UnboundedSender<ForwardEvent>, server_id: String) -> Self {
        Self {
            tx: Some(tx),
            server_id,
            instance: 0,
        }
    }

    pub fn noop(server_id: String) -> Self {
        Self {
            tx: None,
            server_id,
            instance: 0,
        }
    }

    pub fn for_instance(&self, instance: u64) -> Self {
        Self {
            instance,
            ..self.clone()
        }
    }

    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn emit(&self, event: ForwardEvent) {
        if let Some(ref tx) = self.tx {
            if tx.send(event).is_err() {
                tracing::debug!("Forward event dropped, receiver gone");
            }
        }
    }

    pub fn emit_channel_failed(&self, link_id: &str, error: String) {
        self.emit(ForwardEvent::ChannelFailed {
            server_id: self.server_id.clone(),
            link_id: link_id.to_string(),
            instance: self.instance,
            error,
        });
    }

    pub fn emit_channel_recovered(&self, link_id: &str) {
        self.emit(ForwardEvent::ChannelRecovered {
            server_id: self.server_id.clone(),
            link_id: link_id.to_string(),
            instance: self.instance,
        });
    }

    pub fn emit_listener_closed(&self, link_id: &str, reason: String) {
        self.emit(ForwardEvent::ListenerClosed {
            server_id: self.server_id.clone(),
            link_id: link_id.to_string(),
            instance: self.instance,
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emitter_tags_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = ForwardEventEmitter::new(tx, "s1".into()).for_instance(7);
        emitter.emit_channel_failed("l1", "refused".into());

        let event = rx.try_recv().unwrap();
        assert_eq!(event.link_id(), "l1");
        assert_eq!(event.instance(), 7);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "channelFailed");
        assert_eq!(json["server_id"], "s1");
    }

    #[test]
    fn test_noop_emitter() {
        ForwardEventEmitter::noop("s1".into()).emit_listener_closed("l1", "gone".into());
    }
}
