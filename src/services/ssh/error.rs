//! Errors surfaced by tunnel setup and teardown.
//!
//! Only one-time operations report errors. Accept failures, channel opens and
//! relay I/O are handled inside the tunnel and never reach the caller.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Could not determine home directory")]
    HomeDirUnavailable,

    #[error("Failed to read SSH config {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse SSH config {}, line {line}: {message}", path.display())]
    ConfigParse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Failed to read SSH key {}: {source}", path.display())]
    KeyRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse SSH key {}: {source}", path.display())]
    KeyParse {
        path: PathBuf,
        #[source]
        source: russh::keys::Error,
    },

    #[error("Failed to connect to SSH server {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: russh::Error,
    },

    #[error("Connection to SSH server {addr} timed out after {after:?}")]
    ConnectTimeout { addr: String, after: Duration },

    #[error("Host key verification failed for {addr}")]
    HostKeyRejected { addr: String },

    #[error("SSH authentication error for {user}@{addr}: {source}")]
    Auth {
        user: String,
        addr: String,
        #[source]
        source: russh::Error,
    },

    #[error("Authentication failed for {user}@{addr}: public key rejected")]
    AuthRejected { user: String, addr: String },

    #[error("Invalid remote target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("Failed to start local listener on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to close SSH transport: {0}")]
    Close(#[source] russh::Error),
}
