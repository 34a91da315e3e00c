//! SSH tunneling for database connections.
//!
//! This module provides:
//! - `SshTunnel` - Local port forwarding over one authenticated russh session
//! - `SshConfig` - Alias lookup in `~/.ssh/config`
//! - `Transport` - The session seam the tunnel opens channels through

mod config;
mod error;
mod registry;
mod transport;
mod tunnel;
mod types;

pub use config::{SshConfig, default_config_path, expand_tilde, resolve_host};
pub use error::TunnelError;
pub use registry::{SessionInfo, SessionKey};
pub use transport::{SshTransport, Transport};
pub use tunnel::{SshTunnel, TunnelId};
pub use types::{DEFAULT_SSH_PORT, HostKeyPolicy, HostParams, RemoteTarget, SshTunnelConfig};
