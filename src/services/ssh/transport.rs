//! Authenticated transport used by the tunnel to open forwarding channels.
//!
//! `SshTransport` wraps a russh client session. Every relayed connection gets
//! its own `direct-tcpip` channel multiplexed over that one session.

use super::error::TunnelError;
use super::types::{HostKeyPolicy, HostParams, RemoteTarget, SshTunnelConfig};
use russh::client::{self, Handle};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey, check_known_hosts_path, decode_secret_key};
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// A session capable of opening byte-stream channels to a remote target.
///
/// `open_channel` may be called concurrently from many relays. `close` is
/// called exactly once, after every relay has exited.
pub trait Transport: Send + Sync + 'static {
    type Channel: AsyncRead + AsyncWrite + Send + 'static;

    fn open_channel(
        &self,
        target: &RemoteTarget,
    ) -> impl Future<Output = io::Result<Self::Channel>> + Send;

    fn close(&self) -> impl Future<Output = Result<(), TunnelError>> + Send;
}

/// russh handler: only host key verification is customised
struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match &self.policy {
            HostKeyPolicy::AcceptAny => Ok(true),
            HostKeyPolicy::KnownHosts(path) => {
                match check_known_hosts_path(&self.host, self.port, server_public_key, path) {
                    Ok(true) => {
                        tracing::debug!("Host key verified for {}:{}", self.host, self.port);
                        Ok(true)
                    }
                    Ok(false) => {
                        tracing::warn!(
                            "Host key for {}:{} not found in {}",
                            self.host,
                            self.port,
                            path.display()
                        );
                        Ok(false)
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Host key check for {}:{} failed: {}",
                            self.host,
                            self.port,
                            e
                        );
                        Ok(false)
                    }
                }
            }
        }
    }
}

/// An authenticated SSH session
pub struct SshTransport {
    handle: Handle<ClientHandler>,
}

impl SshTransport {
    /// Load the identity, dial the server and authenticate with the key.
    ///
    /// The session is disconnected before any authentication error is returned.
    pub async fn connect(params: &HostParams, config: &SshTunnelConfig) -> Result<Self, TunnelError> {
        let addr = params.ssh_addr();

        let pem = tokio::fs::read_to_string(&params.identity_file)
            .await
            .map_err(|source| TunnelError::KeyRead {
                path: params.identity_file.clone(),
                source,
            })?;
        let key = decode_secret_key(&pem, None).map_err(|source| TunnelError::KeyParse {
            path: params.identity_file.clone(),
            source,
        })?;

        if config.host_key_policy == HostKeyPolicy::AcceptAny {
            tracing::warn!(
                "Accepting any host key from {}; configure a known_hosts policy to verify it",
                addr
            );
        }

        let ssh_config = Arc::new(client::Config {
            keepalive_interval: config.keepalive_interval,
            keepalive_max: 3,
            nodelay: true,
            ..Default::default()
        });
        let handler = ClientHandler {
            host: params.hostname.clone(),
            port: params.port,
            policy: config.host_key_policy.clone(),
        };

        tracing::info!("Connecting to SSH server {}", params.ssh_url());

        let mut handle = match tokio::time::timeout(
            config.connect_timeout,
            client::connect(ssh_config, (params.hostname.as_str(), params.port), handler),
        )
        .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(russh::Error::UnknownKey)) => {
                return Err(TunnelError::HostKeyRejected { addr });
            }
            Ok(Err(source)) => return Err(TunnelError::Dial { addr, source }),
            Err(_) => {
                return Err(TunnelError::ConnectTimeout {
                    addr,
                    after: config.connect_timeout,
                });
            }
        };

        match authenticate(&mut handle, &params.user, key).await {
            Ok(true) => {}
            Ok(false) => {
                disconnect_quietly(&handle).await;
                return Err(TunnelError::AuthRejected {
                    user: params.user.clone(),
                    addr,
                });
            }
            Err(source) => {
                disconnect_quietly(&handle).await;
                return Err(TunnelError::Auth {
                    user: params.user.clone(),
                    addr,
                    source,
                });
            }
        }

        tracing::info!("SSH authentication successful for {}", params.ssh_url());
        Ok(Self { handle })
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    key: russh::keys::PrivateKey,
) -> Result<bool, russh::Error> {
    // RSA keys need the strongest hash the server supports; other key types ignore it
    let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
    let result = handle
        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
        .await?;
    Ok(result.success())
}

async fn disconnect_quietly(handle: &Handle<ClientHandler>) {
    if let Err(e) = handle
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await
    {
        tracing::debug!("SSH disconnect after failed setup: {}", e);
    }
}

impl Transport for SshTransport {
    type Channel = russh::ChannelStream<client::Msg>;

    async fn open_channel(&self, target: &RemoteTarget) -> io::Result<Self::Channel> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(target.host.clone(), u32::from(target.port), "127.0.0.1", 0)
            .await
            .map_err(|e| {
                io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("direct-tcpip channel to {} failed: {}", target, e),
                )
            })?;
        Ok(channel.into_stream())
    }

    async fn close(&self) -> Result<(), TunnelError> {
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(TunnelError::Close)
    }
}
