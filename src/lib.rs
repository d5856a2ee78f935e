//! RelayKeep - supervised SSH port forwarding
//!
//! Keeps a set of server groups connected and their forwarding rules
//! running: local forwards over direct-tcpip channels and reverse
//! ("penetrate") tunnels over remote listeners.

pub mod config;
pub mod forwarding;
pub mod logging;
pub mod session;
pub mod ssh;
pub mod transport;

pub use logging::{init_logging, LogGuard};
