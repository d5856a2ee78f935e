//! Session Management Module
//!
//! Keeps every open server group connected and its links forwarding:
//! - `manager`: actor that applies intents and reconciles supervisors
//! - `supervisor`: per-group state machine with keep-alive and reconnect
//! - `status`: observable status board with change events

mod manager;
mod reconnect;
mod status;
mod supervisor;
mod types;

pub use manager::{ManagerError, SessionManager};
pub use reconnect::ReconnectPolicy;
pub use status::{StatusBoard, StatusEvent};
pub use types::{LinkState, LinkStatus, ServerState, ServerStatus, SessionHealth};
