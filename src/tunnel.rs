//! Tunnel Orchestrator
//!
//! Connects and authenticates the SSH session, binds the local listener and
//! wires every accepted connection to a `direct-tcpip` channel.
//!
//! ```text
//! Disconnected → Connecting → Authenticating → ListenerBinding → Active
//!       ▲                                                          │
//!       └──────────────── disconnect() / transport lost ───────────┘
//! ```
//!
//! A constructed [`SshTunnel`] is always `Active` or already torn down:
//! construction only returns once the listener has bound, so
//! [`SshTunnel::local_port`] is always a real port.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::forwarding::{
    splice, ChannelPairRegistry, ConnectionForwarder, ForwardStats, IoEndpoint,
    LocalForwardListener, PairInfo,
};
use crate::ssh::{
    spawn_handle_owner_task, ForwardingTransport, HandleController, SshClient, TunnelConfig,
    TunnelError,
};

/// Lifecycle of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Disconnected,
    Connecting,
    Authenticating,
    ListenerBinding,
    Active,
}

/// Opens a `direct-tcpip` channel per accepted connection and splices it
struct DirectTcpipForwarder<T> {
    transport: T,
    target_host: String,
    target_port: u16,
    channel_open_timeout: Option<Duration>,
    channel_buffer: usize,
    pairs: Arc<ChannelPairRegistry>,
}

#[async_trait]
impl<T: ForwardingTransport> ConnectionForwarder for DirectTcpipForwarder<T> {
    async fn forward(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), TunnelError> {
        if self.pairs.is_closed() {
            return Err(TunnelError::Disconnected);
        }

        let open = self
            .transport
            .open_direct_tcpip(&self.target_host, self.target_port, peer);
        let channel = match self.channel_open_timeout {
            Some(limit) => tokio::time::timeout(limit, open).await.map_err(|_| {
                TunnelError::Timeout(format!(
                    "opening channel to {}:{} after {}s",
                    self.target_host,
                    self.target_port,
                    limit.as_secs()
                ))
            })??,
            None => open.await?,
        };

        let guard = self.pairs.register(peer);
        debug!(
            "Pair {}: {} <-> {} ({}:{})",
            guard.id(),
            peer,
            channel.label,
            self.target_host,
            self.target_port
        );

        let closer = guard.closer();
        let capacity = self.channel_buffer;
        tokio::spawn(async move {
            let report = splice(IoEndpoint::new(stream), channel, capacity, closer).await;
            debug!(
                "Pair {} closed: {} bytes sent, {} bytes received ({:?} / {:?})",
                guard.id(),
                report.bytes_to_remote(),
                report.bytes_to_local(),
                report.local.outcome,
                report.remote.outcome
            );
            guard.finish(&report);
        });
        Ok(())
    }
}

/// A running local port forward over SSH
pub struct SshTunnel<T: ForwardingTransport = HandleController> {
    id: String,
    target: String,
    transport: T,
    listener: Mutex<LocalForwardListener>,
    local_addr: SocketAddr,
    pairs: Arc<ChannelPairRegistry>,
    state: Arc<watch::Sender<TunnelState>>,
    watcher: JoinHandle<()>,
    disconnected: AtomicBool,
}

impl SshTunnel<HandleController> {
    /// Connect, authenticate and start listening.
    ///
    /// Returns once the local listener is bound.
    pub async fn connect(config: TunnelConfig) -> Result<Self, TunnelError> {
        config.validate()?;
        let config = Arc::new(config);
        let id = uuid::Uuid::new_v4().to_string();
        let state = Arc::new(watch::channel(TunnelState::Disconnected).0);

        info!(
            "Opening tunnel {} via {}@{} to {}:{}",
            id,
            config.username,
            config.server_addr(),
            config.target_host,
            config.target_port
        );

        state.send_replace(TunnelState::Connecting);
        let client = SshClient::new(config.clone());
        let mut handle = match client.connect().await {
            Ok(handle) => handle,
            Err(e) => {
                state.send_replace(TunnelState::Disconnected);
                return Err(e);
            }
        };

        state.send_replace(TunnelState::Authenticating);
        if let Err(e) = client.authenticate(&mut handle).await {
            warn!("Authentication failed for tunnel {}: {}", id, e);
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "Authentication failed", "en")
                .await;
            state.send_replace(TunnelState::Disconnected);
            return Err(e);
        }

        let controller = spawn_handle_owner_task(handle, id.clone(), config.channel_buffer);
        Self::start(id, &config, controller, state).await
    }
}

impl<T: ForwardingTransport> SshTunnel<T> {
    /// Start a tunnel over an already authenticated transport
    pub async fn with_transport(config: TunnelConfig, transport: T) -> Result<Self, TunnelError> {
        config.validate()?;
        let id = uuid::Uuid::new_v4().to_string();
        let state = Arc::new(watch::channel(TunnelState::Disconnected).0);
        Self::start(id, &config, transport, state).await
    }

    async fn start(
        id: String,
        config: &TunnelConfig,
        transport: T,
        state: Arc<watch::Sender<TunnelState>>,
    ) -> Result<Self, TunnelError> {
        state.send_replace(TunnelState::ListenerBinding);

        let pairs = ChannelPairRegistry::new();
        let forwarder = Arc::new(DirectTcpipForwarder {
            transport: transport.clone(),
            target_host: config.target_host.clone(),
            target_port: config.target_port,
            channel_open_timeout: config.channel_open_timeout(),
            channel_buffer: config.channel_buffer,
            pairs: pairs.clone(),
        });

        // Subscribed before binding so a disconnect in between is not missed
        let mut disconnect_rx = transport.subscribe_disconnect();
        let listener = match LocalForwardListener::bind(
            &config.bind_host,
            config.bind_port,
            forwarder,
            transport.subscribe_disconnect(),
        )
        .await
        {
            Ok(listener) => listener,
            Err(e) => {
                warn!(
                    "Tunnel {} could not bind {}:{}: {}",
                    id, config.bind_host, config.bind_port, e
                );
                transport.disconnect().await;
                state.send_replace(TunnelState::Disconnected);
                return Err(e);
            }
        };
        let local_addr = listener.local_addr();

        let watcher = {
            let pairs = pairs.clone();
            let state = state.clone();
            let id = id.clone();
            tokio::spawn(async move {
                // Closed sender means the transport is gone as well
                let _ = disconnect_rx.recv().await;
                let closed = pairs.close_all();
                if *state.borrow() == TunnelState::Active {
                    info!("Tunnel {} lost its SSH connection, closed {} pair(s)", id, closed);
                }
                state.send_replace(TunnelState::Disconnected);
            })
        };

        state.send_replace(TunnelState::Active);
        let target = format!("{}:{}", config.target_host, config.target_port);
        info!("Tunnel {} active: {} -> {}", id, local_addr, target);

        Ok(Self {
            id,
            target,
            transport,
            listener: Mutex::new(listener),
            local_addr,
            pairs,
            state,
            watcher,
            disconnected: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Address the local listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// "host:port" the SSH server connects to
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    /// Receiver for state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<TunnelState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> ForwardStats {
        self.pairs.stats()
    }

    pub fn active_pairs(&self) -> Vec<PairInfo> {
        self.pairs.active_pairs()
    }

    /// Close the listener, every active pair and the SSH connection.
    /// Repeated calls are no-ops.
    pub async fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Disconnecting tunnel {}", self.id);
        self.listener.lock().await.close().await;
        let closed = self.pairs.close_all();
        self.transport.disconnect().await;
        self.state.send_replace(TunnelState::Disconnected);
        info!("Tunnel {} disconnected ({} pair(s) closed)", self.id, closed);
    }
}

impl<T: ForwardingTransport> Drop for SshTunnel<T> {
    fn drop(&mut self) {
        self.watcher.abort();
        if !self.disconnected.swap(true, Ordering::SeqCst) {
            // Listener task is aborted by its own Drop; the transport goes
            // away with its last handle
            self.pairs.close_all();
            self.state.send_replace(TunnelState::Disconnected);
            debug!("Tunnel {} dropped without disconnect()", self.id);
        }
    }
}

/// A tunnel for synchronous callers.
///
/// Owns a single-worker runtime that drives the SSH session and every relay.
/// Disconnects on drop.
pub struct BlockingTunnel {
    runtime: Option<tokio::runtime::Runtime>,
    tunnel: Option<SshTunnel>,
    local_addr: SocketAddr,
}

impl BlockingTunnel {
    /// Grace period for the SSH disconnect exchange on teardown
    const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

    /// Connect and block until the local listener is bound.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous context, like
    /// `Runtime::block_on`.
    pub fn open(config: TunnelConfig) -> Result<Self, TunnelError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("sshtunnel-io")
            .enable_all()
            .build()?;

        let tunnel = runtime.block_on(SshTunnel::connect(config))?;
        let local_addr = tunnel.local_addr();
        Ok(Self {
            runtime: Some(runtime),
            tunnel: Some(tunnel),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn state(&self) -> TunnelState {
        self.tunnel
            .as_ref()
            .map(|tunnel| tunnel.state())
            .unwrap_or(TunnelState::Disconnected)
    }

    pub fn stats(&self) -> ForwardStats {
        self.tunnel.as_ref().map(|tunnel| tunnel.stats()).unwrap_or_default()
    }

    /// Tear down the tunnel and its runtime. Repeated calls are no-ops.
    pub fn disconnect(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };

        if let Some(tunnel) = self.tunnel.take() {
            // Runs on the runtime's worker, so this never calls block_on
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            runtime.spawn(async move {
                tunnel.disconnect().await;
                drop(tunnel);
                let _ = done_tx.send(());
            });
            if done_rx.recv_timeout(Self::SHUTDOWN_GRACE).is_err() {
                warn!("Tunnel did not disconnect within {:?}", Self::SHUTDOWN_GRACE);
            }
        }

        runtime.shutdown_background();
    }
}

impl Drop for BlockingTunnel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::{ChannelCommand, ChannelEnvelope, Credential, RemoteChannel};
    use bytes::Bytes;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::{broadcast, mpsc};

    #[derive(Debug, Clone, Copy)]
    enum MockOpen {
        Accept,
        Refuse,
        Hang,
    }

    /// Server side of a channel opened through [`MockTransport`]
    struct MockPeer {
        inbound: mpsc::Sender<ChannelEnvelope>,
        outbound: mpsc::Receiver<ChannelCommand>,
        originator: SocketAddr,
    }

    impl MockPeer {
        async fn expect_data(&mut self) -> Bytes {
            match self.outbound.recv().await {
                Some(ChannelCommand::Data(data)) => data,
                other => panic!("expected channel data, got {:?}", other),
            }
        }

        async fn reply(&self, data: &'static [u8]) {
            self.inbound
                .send(ChannelEnvelope::Data(Bytes::from_static(data)))
                .await
                .unwrap();
        }
    }

    #[derive(Clone)]
    struct MockTransport {
        script: Arc<SyncMutex<VecDeque<MockOpen>>>,
        opened: Arc<SyncMutex<Vec<(String, u16)>>>,
        peers: mpsc::UnboundedSender<MockPeer>,
        disconnect_tx: broadcast::Sender<()>,
        disconnects: Arc<AtomicUsize>,
    }

    impl MockTransport {
        fn new(script: &[MockOpen]) -> (Self, mpsc::UnboundedReceiver<MockPeer>) {
            let (peers, peers_rx) = mpsc::unbounded_channel();
            let (disconnect_tx, _) = broadcast::channel(1);
            (
                Self {
                    script: Arc::new(SyncMutex::new(script.iter().copied().collect())),
                    opened: Arc::new(SyncMutex::new(Vec::new())),
                    peers,
                    disconnect_tx,
                    disconnects: Arc::new(AtomicUsize::new(0)),
                },
                peers_rx,
            )
        }
    }

    #[async_trait]
    impl ForwardingTransport for MockTransport {
        async fn open_direct_tcpip(
            &self,
            target_host: &str,
            target_port: u16,
            originator: SocketAddr,
        ) -> Result<RemoteChannel, TunnelError> {
            self.opened.lock().push((target_host.to_string(), target_port));
            let next = self.script.lock().pop_front().unwrap_or(MockOpen::Accept);
            match next {
                MockOpen::Accept => {
                    let (inbound_tx, inbound_rx) = mpsc::channel(8);
                    let (outbound_tx, outbound_rx) = mpsc::channel(8);
                    let _ = self.peers.send(MockPeer {
                        inbound: inbound_tx,
                        outbound: outbound_rx,
                        originator,
                    });
                    Ok(RemoteChannel::new("mock", inbound_rx, outbound_tx))
                }
                MockOpen::Refuse => Err(TunnelError::ChannelError("connect failed".into())),
                MockOpen::Hang => std::future::pending().await,
            }
        }

        fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
            self.disconnect_tx.subscribe()
        }

        async fn disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            let _ = self.disconnect_tx.send(());
        }
    }

    fn config() -> TunnelConfig {
        TunnelConfig::new(
            "ssh.example.com",
            22,
            "deploy",
            Credential::password("pw"),
            "db.internal",
            5432,
        )
        .with_bind("127.0.0.1", 0)
    }

    async fn read_closed(stream: &mut TcpStream) -> bool {
        let mut buf = Vec::new();
        matches!(
            tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }

    #[tokio::test]
    async fn test_relays_to_target() {
        let (transport, mut peers) = MockTransport::new(&[]);
        let tunnel = SshTunnel::with_transport(config(), transport.clone())
            .await
            .unwrap();
        assert_eq!(tunnel.state(), TunnelState::Active);
        assert_ne!(tunnel.local_port(), 0);
        assert_eq!(tunnel.target(), "db.internal:5432");

        let mut client = TcpStream::connect(tunnel.local_addr()).await.unwrap();
        client.write_all(b"PING").await.unwrap();

        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.originator, client.local_addr().unwrap());
        assert_eq!(&peer.expect_data().await[..], b"PING");
        peer.reply(b"PONG").await;

        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"PONG");
        assert_eq!(
            transport.opened.lock().as_slice(),
            &[("db.internal".to_string(), 5432)]
        );
        assert_eq!(tunnel.active_pairs().len(), 1);

        tunnel.disconnect().await;
    }

    #[tokio::test]
    async fn test_refused_channel_closes_only_that_connection() {
        let (transport, mut peers) = MockTransport::new(&[MockOpen::Refuse]);
        let tunnel = SshTunnel::with_transport(config(), transport).await.unwrap();

        let mut refused = TcpStream::connect(tunnel.local_addr()).await.unwrap();
        assert!(read_closed(&mut refused).await);

        let mut client = TcpStream::connect(tunnel.local_addr()).await.unwrap();
        client.write_all(b"PING").await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        assert_eq!(&peer.expect_data().await[..], b"PING");
        assert_eq!(tunnel.state(), TunnelState::Active);

        tunnel.disconnect().await;
    }

    #[tokio::test]
    async fn test_extended_data_closes_only_its_pair() {
        let (transport, mut peers) = MockTransport::new(&[]);
        let tunnel = SshTunnel::with_transport(config(), transport).await.unwrap();

        let mut first = TcpStream::connect(tunnel.local_addr()).await.unwrap();
        first.write_all(b"one").await.unwrap();
        let mut first_peer = peers.recv().await.unwrap();
        first_peer.expect_data().await;

        let mut second = TcpStream::connect(tunnel.local_addr()).await.unwrap();
        second.write_all(b"two").await.unwrap();
        let mut second_peer = peers.recv().await.unwrap();
        second_peer.expect_data().await;

        first_peer
            .inbound
            .send(ChannelEnvelope::ExtendedData {
                code: 1,
                data: Bytes::from_static(b"stderr"),
            })
            .await
            .unwrap();
        assert!(read_closed(&mut first).await);
        assert_eq!(first_peer.outbound.recv().await, Some(ChannelCommand::Close));

        second_peer.reply(b"still here").await;
        let mut reply = [0u8; 10];
        second.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"still here");

        tunnel.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (transport, mut peers) = MockTransport::new(&[]);
        let tunnel = SshTunnel::with_transport(config(), transport.clone())
            .await
            .unwrap();
        let addr = tunnel.local_addr();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"x").await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        peer.expect_data().await;

        tunnel.disconnect().await;
        tunnel.disconnect().await;

        assert_eq!(tunnel.state(), TunnelState::Disconnected);
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
        assert!(read_closed(&mut client).await);
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_transport_loss_tears_down() {
        let (transport, mut peers) = MockTransport::new(&[]);
        let tunnel = SshTunnel::with_transport(config(), transport.clone())
            .await
            .unwrap();
        let mut state = tunnel.subscribe_state();

        let mut client = TcpStream::connect(tunnel.local_addr()).await.unwrap();
        client.write_all(b"x").await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        peer.expect_data().await;

        // Server side goes away on its own
        transport.disconnect_tx.send(()).unwrap();

        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == TunnelState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(read_closed(&mut client).await);
    }

    #[tokio::test]
    async fn test_channel_open_timeout_closes_connection() {
        let (transport, _peers) = MockTransport::new(&[MockOpen::Hang]);
        let tunnel = SshTunnel::with_transport(
            config().with_channel_open_timeout(Duration::from_secs(1)),
            transport,
        )
        .await
        .unwrap();

        let mut client = TcpStream::connect(tunnel.local_addr()).await.unwrap();
        assert!(read_closed(&mut client).await);
        assert_eq!(tunnel.state(), TunnelState::Active);

        tunnel.disconnect().await;
    }

    #[tokio::test]
    async fn test_bind_failure_disconnects_transport() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let (transport, _peers) = MockTransport::new(&[]);

        let result =
            SshTunnel::with_transport(config().with_bind("127.0.0.1", port), transport.clone())
                .await;
        assert!(matches!(result, Err(TunnelError::ConnectionFailed(_))));
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let (transport, _peers) = MockTransport::new(&[]);
        let mut config = config();
        config.target_port = 0;
        assert!(matches!(
            SshTunnel::with_transport(config, transport).await,
            Err(TunnelError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_timeout_against_silent_server() {
        // Accepts TCP but never speaks SSH
        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let config = TunnelConfig::new(
            "127.0.0.1",
            port,
            "deploy",
            Credential::password("pw"),
            "db.internal",
            5432,
        )
        .with_connect_timeout(Duration::from_secs(1));

        let started = std::time::Instant::now();
        let result = SshTunnel::connect(config).await;
        assert!(matches!(result, Err(TunnelError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(silent);
    }

    #[tokio::test]
    async fn test_connect_without_timeout_waits() {
        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        let config = TunnelConfig::new(
            "127.0.0.1",
            port,
            "deploy",
            Credential::password("pw"),
            "db.internal",
            5432,
        );

        let pending =
            tokio::time::timeout(Duration::from_millis(300), SshTunnel::connect(config)).await;
        assert!(pending.is_err());
        drop(silent);
    }

    #[test]
    fn test_blocking_open_reports_connection_failure() {
        // Bind then drop to get a port nobody listens on
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = TunnelConfig::new(
            "127.0.0.1",
            port,
            "deploy",
            Credential::password("pw"),
            "db.internal",
            5432,
        );
        assert!(matches!(
            BlockingTunnel::open(config),
            Err(TunnelError::ConnectionFailed(_))
        ));
    }
}
