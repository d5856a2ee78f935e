//! SSH module - handles SSH connections using the russh library
//!
//! # Features
//! - Password and private-key authentication
//! - Outbound dialing through a SOCKS5 proxy from the environment
//! - Single-owner handle task with a cloneable controller
//! - Per-connection routing of server-opened forwarded channels

mod client;
mod config;
mod error;
mod forward_registry;
mod handle_owner;
mod proxy;

pub use client::{fingerprint, ClientHandler, SshClient, SshConnection};
pub use config::{AuthMethod, SshConfig};
pub use error::{ErrorKind, SshError};
pub use forward_registry::RemoteForwardRegistry;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController, PingResult};
pub use proxy::{dial, Socks5Proxy};
