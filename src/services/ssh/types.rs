//! SSH tunnel configuration types.

use super::error::TunnelError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default SSH server port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// How the remote host's identity is checked during the handshake
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Accept whatever key the server presents. Known gap, logged on every establish.
    #[default]
    AcceptAny,
    /// Require the key to be present in an OpenSSH `known_hosts` file
    KnownHosts(PathBuf),
}

/// Configuration for a tunnel resolved through `~/.ssh/config`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshTunnelConfig {
    /// Host alias looked up in the SSH client configuration
    pub alias: String,
    /// `host:port` to forward to, as seen from the SSH server
    pub remote_target: String,
    /// Override for the client configuration file (default: ~/.ssh/config)
    pub ssh_config_path: Option<PathBuf>,
    /// Time allowed for dialing and the SSH handshake
    pub connect_timeout: Duration,
    /// SSH keepalive interval (None disables keepalives)
    pub keepalive_interval: Option<Duration>,
    /// Host identity verification
    pub host_key_policy: HostKeyPolicy,
}

impl SshTunnelConfig {
    pub fn new(alias: impl Into<String>, remote_target: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            remote_target: remote_target.into(),
            ssh_config_path: None,
            connect_timeout: Duration::from_secs(15),
            keepalive_interval: Some(Duration::from_secs(30)),
            host_key_policy: HostKeyPolicy::default(),
        }
    }

    /// Read host configuration from a specific file instead of ~/.ssh/config
    pub fn with_ssh_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssh_config_path = Some(path.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Option<Duration>) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }
}

/// Connection parameters for one alias after config lookup and fallbacks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostParams {
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub identity_file: PathBuf,
}

impl HostParams {
    /// Address dialed for the SSH transport
    pub fn ssh_addr(&self) -> String {
        format_host_port(&self.hostname, self.port)
    }

    /// Build the SSH URL (user@host:port), used in log lines
    pub fn ssh_url(&self) -> String {
        if self.user.is_empty() {
            self.ssh_addr()
        } else {
            format!("{}@{}", self.user, self.ssh_addr())
        }
    }
}

/// Final destination of forwarded connections, reachable from the SSH server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
}

impl RemoteTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_host_port(&self.host, self.port))
    }
}

impl FromStr for RemoteTarget {
    type Err = TunnelError;

    /// Parses `host:port`, `[v6addr]:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| TunnelError::InvalidTarget {
            target: s.to_string(),
            reason: reason.to_string(),
        };

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| invalid("unterminated '[' in IPv6 address"))?;
            let port = after
                .strip_prefix(':')
                .ok_or_else(|| invalid("missing port"))?;
            (host, port)
        } else {
            let (host, port) = s.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
            if host.contains(':') {
                return Err(invalid("IPv6 addresses must be bracketed"));
            }
            (host, port)
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;

        Ok(Self::new(host, port))
    }
}

/// Join host and port, bracketing IPv6 literals
pub(crate) fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
