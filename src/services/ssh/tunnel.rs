//! Local port forwarding over an authenticated SSH session.
//!
//! An `SshTunnel` binds an ephemeral loopback port and relays every accepted
//! connection through its own channel to one remote target.
//!
//! Cancellation contract: teardown sets a level-triggered shutdown signal.
//! The accept loop and every relay select on it, and a relay that observes it
//! drops both of its streams. Dropping the sockets is what releases a copy
//! direction still blocked on the peer, so no per-direction cancel is needed.

use super::config::resolve_host;
use super::error::TunnelError;
use super::registry::{SessionGuard, SessionInfo, SessionRegistry};
use super::transport::{SshTransport, Transport};
use super::types::{RemoteTarget, SshTunnelConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Unique identifier for a tunnel, used in log lines
pub type TunnelId = Uuid;

/// The tunnel only ever listens on loopback
const LOCAL_BIND_HOST: &str = "127.0.0.1";

/// Pause after a failed accept before listening again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Upper bound for signalling EOF on a channel while closing a relay
const CHANNEL_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// State shared by the accept loop and all relays
struct Shared<T: Transport> {
    id: TunnelId,
    transport: T,
    remote: RemoteTarget,
    sessions: Arc<SessionRegistry>,
    shutdown_rx: watch::Receiver<bool>,
}

/// An active tunnel. Call [`SshTunnel::teardown`] when it is no longer needed.
pub struct SshTunnel<T: Transport = SshTransport> {
    shared: Arc<Shared<T>>,
    local_addr: String,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
}

impl SshTunnel<SshTransport> {
    /// Resolve `config.alias` from the SSH client configuration, authenticate,
    /// and start forwarding to `config.remote_target`.
    pub async fn establish(config: SshTunnelConfig) -> Result<Self, TunnelError> {
        let remote: RemoteTarget = config.remote_target.parse()?;
        let params = resolve_host(config.ssh_config_path.as_deref(), &config.alias)?;
        let transport = SshTransport::connect(&params, &config).await?;

        let tunnel = Self::start(transport, remote).await?;
        tracing::info!(
            "SSH tunnel {} established: {} -> {} via {}",
            tunnel.id(),
            tunnel.local_addr(),
            tunnel.remote_target(),
            params.ssh_url()
        );
        Ok(tunnel)
    }
}

impl<T: Transport> SshTunnel<T> {
    /// Start forwarding over an already authenticated transport.
    ///
    /// If the local listener cannot be opened the transport is closed before
    /// the error is returned.
    pub async fn start(transport: T, remote: RemoteTarget) -> Result<Self, TunnelError> {
        let bind_addr = format!("{}:0", LOCAL_BIND_HOST);
        let bound = match TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, addr) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                if let Err(e) = transport.close().await {
                    tracing::debug!("Closing transport after listen failure: {}", e);
                }
                return Err(TunnelError::Listen {
                    addr: bind_addr,
                    source,
                });
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            transport,
            remote,
            sessions: SessionRegistry::new(),
            shutdown_rx,
        });

        let accept_task = tokio::spawn(accept_loop(Arc::clone(&shared), listener));
        tracing::debug!("Tunnel {} listening on {}", shared.id, addr);

        Ok(Self {
            shared,
            local_addr: addr.to_string(),
            shutdown_tx,
            accept_task: Some(accept_task),
        })
    }

    /// The `host:port` database clients should connect to
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn remote_target(&self) -> &RemoteTarget {
        &self.shared.remote
    }

    pub fn id(&self) -> TunnelId {
        self.shared.id
    }

    /// Number of connections currently being relayed
    pub fn active_sessions(&self) -> usize {
        self.shared.sessions.len()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.shared.sessions.snapshot()
    }

    /// Stop accepting, wait for every relay to exit, then close the transport.
    ///
    /// Returns the transport's close error, if any.
    pub async fn teardown(mut self) -> Result<(), TunnelError> {
        let id = self.shared.id;
        tracing::debug!(
            "Shutting down tunnel {} ({} active sessions)",
            id,
            self.shared.sessions.len()
        );

        self.shutdown_tx.send_replace(true);

        // The accept task owns the listener; once it has exited the port is closed
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                tracing::debug!("Accept loop for tunnel {} ended abnormally: {}", id, e);
            }
        }

        self.shared.sessions.wait_idle().await;

        let result = self.shared.transport.close().await;
        match &result {
            Ok(()) => tracing::info!("SSH tunnel {} shutdown complete", id),
            Err(e) => tracing::warn!("SSH tunnel {} closed with error: {}", id, e),
        }
        result
    }
}

impl<T: Transport> Drop for SshTunnel<T> {
    fn drop(&mut self) {
        // Only reached with a live accept task when teardown was skipped
        self.shutdown_tx.send_replace(true);
        if let Some(task) = self.accept_task.take() {
            tracing::debug!("Tunnel {} dropped without teardown", self.shared.id);
            task.abort();
        }
    }
}

/// Resolves once the shutdown flag is set (or its sender is gone)
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn accept_loop<T: Transport>(shared: Arc<Shared<T>>, listener: TcpListener) {
    let mut shutdown = shared.shutdown_rx.clone();

    loop {
        let accepted = tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let guard = shared.sessions.register(peer);
                tracing::debug!(
                    "Tunnel {} accepted connection from {} as session {}",
                    shared.id,
                    peer,
                    guard.key()
                );
                tokio::spawn(relay(Arc::clone(&shared), stream, peer, guard));
            }
            Err(e) => {
                if *shutdown.borrow() {
                    break;
                }
                tracing::warn!("Tunnel {} accept failed, continuing: {}", shared.id, e);
                tokio::select! {
                    _ = stopped(&mut shutdown) => break,
                    _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                }
            }
        }
    }

    drop(listener);
    tracing::debug!("Tunnel {} stopped accepting connections", shared.id);
}

/// How a relay finished
#[derive(Debug)]
enum RelayEnd {
    ClientClosed(std::io::Result<u64>),
    RemoteClosed(std::io::Result<u64>),
    Shutdown,
}

async fn relay<T: Transport>(
    shared: Arc<Shared<T>>,
    local: TcpStream,
    peer: SocketAddr,
    guard: SessionGuard,
) {
    relay_session(&shared, local, peer).await;
    // Every stream of this session has been dropped by now
    drop(guard);
}

async fn relay_session<T: Transport>(shared: &Shared<T>, mut local: TcpStream, peer: SocketAddr) {
    let mut shutdown = shared.shutdown_rx.clone();

    let channel = tokio::select! {
        opened = shared.transport.open_channel(&shared.remote) => match opened {
            Ok(channel) => channel,
            Err(e) => {
                tracing::debug!(
                    "Tunnel {} dropping connection from {}: {}",
                    shared.id,
                    peer,
                    e
                );
                return;
            }
        },
        _ = stopped(&mut shutdown) => return,
    };

    let _ = local.set_nodelay(true);
    let (mut local_rd, mut local_wr) = local.split();
    let (mut remote_rd, mut remote_wr) = tokio::io::split(channel);

    let end = tokio::select! {
        copied = tokio::io::copy(&mut local_rd, &mut remote_wr) => RelayEnd::ClientClosed(copied),
        copied = tokio::io::copy(&mut remote_rd, &mut local_wr) => RelayEnd::RemoteClosed(copied),
        _ = stopped(&mut shutdown) => RelayEnd::Shutdown,
    };

    let _ = tokio::time::timeout(CHANNEL_CLOSE_GRACE, remote_wr.shutdown()).await;

    match end {
        RelayEnd::ClientClosed(Ok(bytes)) => tracing::debug!(
            "Tunnel {}: client {} closed after sending {} bytes",
            shared.id,
            peer,
            bytes
        ),
        RelayEnd::RemoteClosed(Ok(bytes)) => tracing::debug!(
            "Tunnel {}: remote closed connection for {} after {} bytes",
            shared.id,
            peer,
            bytes
        ),
        RelayEnd::ClientClosed(Err(e)) | RelayEnd::RemoteClosed(Err(e)) => {
            tracing::debug!("Tunnel {}: relay for {} ended: {}", shared.id, peer, e)
        }
        RelayEnd::Shutdown => {
            tracing::debug!("Tunnel {}: relay for {} stopped by shutdown", shared.id, peer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Dials the remote target directly instead of through SSH
    #[derive(Default)]
    struct LoopbackTransport {
        fail_next_opens: AtomicUsize,
        opens: AtomicUsize,
        closes: Arc<AtomicUsize>,
        closed: AtomicBool,
    }

    impl LoopbackTransport {
        fn failing_first(n: usize) -> Self {
            Self {
                fail_next_opens: AtomicUsize::new(n),
                ..Default::default()
            }
        }
    }

    impl Transport for LoopbackTransport {
        type Channel = TcpStream;

        async fn open_channel(&self, target: &RemoteTarget) -> io::Result<TcpStream> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.closed.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
            }
            let fail = self
                .fail_next_opens
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "channel refused"));
            }
            TcpStream::connect((target.host.as_str(), target.port)).await
        }

        async fn close(&self) -> Result<(), TunnelError> {
            self.closed.store(true, Ordering::SeqCst);
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Echo server standing in for the database; reports each closed connection
    async fn spawn_echo_server() -> (RemoteTarget, tokio::sync::mpsc::UnboundedReceiver<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (closed_tx, closed_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let closed_tx = closed_tx.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    let _ = closed_tx.send(());
                });
            }
        });
        (RemoteTarget::new("127.0.0.1", addr.port()), closed_rx)
    }

    async fn round_trip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
        stream.write_all(payload).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        tokio::time::timeout(TIMEOUT, stream.read_exact(&mut echoed))
            .await
            .expect("echo timed out")
            .unwrap();
        echoed
    }

    async fn wait_for_sessions<T: Transport>(tunnel: &SshTunnel<T>, expected: usize) {
        tokio::time::timeout(TIMEOUT, async {
            while tunnel.active_sessions() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session count never settled");
    }

    #[tokio::test]
    async fn test_local_addr_is_loopback_and_listening() {
        let (target, _closed) = spawn_echo_server().await;
        let tunnel = SshTunnel::start(LoopbackTransport::default(), target.clone())
            .await
            .unwrap();

        let addr: SocketAddr = tunnel.local_addr().parse().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
        assert_eq!(tunnel.remote_target(), &target);

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(round_trip(&mut client, b"ping").await, b"ping");

        drop(client);
        tunnel.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_sessions_do_not_cross_talk() {
        let (target, _closed) = spawn_echo_server().await;
        let tunnel = SshTunnel::start(LoopbackTransport::default(), target)
            .await
            .unwrap();
        let addr = tunnel.local_addr().to_string();

        let mut clients = join_all((0..16).map(|_| TcpStream::connect(addr.clone())))
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        let results = join_all(clients.iter_mut().enumerate().map(|(i, client)| async move {
            let payload = format!("client-{i:02}-{}", "x".repeat(i * 100)).into_bytes();
            let echoed = round_trip(client, &payload).await;
            (payload, echoed)
        }))
        .await;
        for (payload, echoed) in results {
            assert_eq!(payload, echoed);
        }
        wait_for_sessions(&tunnel, 16).await;

        // Closing half the clients leaves the other half untouched
        let survivors = clients.split_off(8);
        drop(clients);
        wait_for_sessions(&tunnel, 8).await;

        let mut survivors = survivors;
        for (i, client) in survivors.iter_mut().enumerate() {
            let payload = format!("again-{i}");
            assert_eq!(round_trip(client, payload.as_bytes()).await, payload.as_bytes());
        }

        drop(survivors);
        tunnel.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_channel_open_keeps_tunnel_serving() {
        let (target, _closed) = spawn_echo_server().await;
        let tunnel = SshTunnel::start(LoopbackTransport::failing_first(1), target)
            .await
            .unwrap();

        let mut rejected = TcpStream::connect(tunnel.local_addr()).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(TIMEOUT, rejected.read(&mut buf))
            .await
            .expect("rejected connection should be closed");
        assert!(matches!(read, Ok(0) | Err(_)));
        wait_for_sessions(&tunnel, 0).await;

        let mut accepted = TcpStream::connect(tunnel.local_addr()).await.unwrap();
        assert_eq!(round_trip(&mut accepted, b"still here").await, b"still here");
        assert_eq!(tunnel.shared.transport.opens.load(Ordering::SeqCst), 2);

        drop(accepted);
        tunnel.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_teardown_closes_in_flight_relays() {
        let (target, mut closed) = spawn_echo_server().await;
        let transport = LoopbackTransport::default();
        let closes = Arc::clone(&transport.closes);
        let tunnel = SshTunnel::start(transport, target).await.unwrap();
        let addr = tunnel.local_addr().to_string();
        let sessions = Arc::clone(&tunnel.shared.sessions);

        const M: usize = 6;
        let mut clients = Vec::new();
        for i in 0..M {
            let mut client = TcpStream::connect(&addr).await.unwrap();
            let payload = format!("in-flight-{i}");
            assert_eq!(round_trip(&mut client, payload.as_bytes()).await, payload.as_bytes());
            clients.push(client);
        }
        wait_for_sessions(&tunnel, M).await;

        tokio::time::timeout(TIMEOUT, tunnel.teardown())
            .await
            .expect("teardown should not hang")
            .unwrap();

        // Join barrier held: nothing registered, transport closed exactly once
        assert!(sessions.is_empty());
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        // Every remote side observed its connection closing
        for _ in 0..M {
            tokio::time::timeout(TIMEOUT, closed.recv())
                .await
                .expect("remote connection left open")
                .unwrap();
        }

        // Every local client sees EOF or a reset
        for mut client in clients {
            let mut buf = [0u8; 16];
            let read = tokio::time::timeout(TIMEOUT, client.read(&mut buf))
                .await
                .expect("local connection left open");
            assert!(matches!(read, Ok(0) | Err(_)));
        }

        // The listener went away with the accept task. The freed port may be
        // reused by another socket, so only check that nothing new is relayed.
        if let Ok(late) = TcpStream::connect(&addr).await {
            drop(late);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn test_teardown_waits_for_remote_stalled_relay() {
        // Remote that accepts and then neither reads nor writes
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (accepted_tx, accepted_rx) = tokio::sync::oneshot::channel();
        let held = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = accepted_tx.send(());
            let mut buf = [0u8; 1];
            // Returns once the relay drops its side
            let _ = stream.read(&mut buf).await;
        });

        let remote = RemoteTarget::new("127.0.0.1", port);
        let tunnel = SshTunnel::start(LoopbackTransport::default(), remote)
            .await
            .unwrap();
        let _client = TcpStream::connect(tunnel.local_addr()).await.unwrap();
        tokio::time::timeout(TIMEOUT, accepted_rx)
            .await
            .expect("relay never reached the remote")
            .unwrap();
        assert_eq!(tunnel.active_sessions(), 1);

        tokio::time::timeout(TIMEOUT, tunnel.teardown())
            .await
            .expect("teardown should not hang")
            .unwrap();
        tokio::time::timeout(TIMEOUT, held)
            .await
            .expect("remote side never released")
            .unwrap();
    }
}
