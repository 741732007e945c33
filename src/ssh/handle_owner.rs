//! Handle Owner Task
//!
//! This module implements the "single owner" pattern for the SSH Handle.
//!
//! # Architecture
//!
//! Only one task owns the `Handle<ClientHandler>`. Listeners and relays
//! communicate with it via `HandleController`, which sends commands through
//! an mpsc channel.
//!
//! This avoids:
//! - `Arc<Mutex<Handle>>` lock contention
//! - Deadlocks from holding locks across `.await`
//! - Protocol violations from concurrent Handle access
//!
//! Channel opens run as their own tasks, so a target the server is slow to
//! reach never holds up other opens or a disconnect.
//!
//! # Usage
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, tunnel_id, 8);
//! let channel = controller
//!     .open_direct_tcpip("db.internal", 5432, "127.0.0.1".parse()?)
//!     .await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::channel_owner::spawn_channel_owner;
use super::client::ClientHandler;
use super::error::TunnelError;
use super::transport::{ForwardingTransport, RemoteChannel};

/// How often the owner checks whether the session died underneath it
const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

/// Commands sent to the Handle Owner Task
pub enum HandleCommand<C = Channel<Msg>> {
    /// Open a direct-tcpip channel (local forward)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<C, russh::Error>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (copies the Sender). Any holder can open channels or
/// disconnect, so do not hand it to code outside the tunnel.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    /// Fired once when the SSH connection is closed.
    disconnect_tx: broadcast::Sender<()>,
    /// Mailbox depth for channels opened through this controller
    channel_buffer: usize,
}

impl HandleController {
    /// Open a direct-tcpip channel and hand it to a channel owner task
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<RemoteChannel, TunnelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port: port as u32,
                originator_host: originator.ip().to_string(),
                originator_port: originator.port() as u32,
                reply_tx,
            })
            .await
            .map_err(|_| TunnelError::Disconnected)?;
        let channel = reply_rx
            .await
            .map_err(|_| TunnelError::Disconnected)?
            .map_err(channel_open_error)?;
        Ok(spawn_channel_owner(channel, self.channel_buffer))
    }

    /// Subscribe to SSH disconnect notifications.
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    /// Disconnect the SSH connection
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

#[async_trait]
impl ForwardingTransport for HandleController {
    async fn open_direct_tcpip(
        &self,
        target_host: &str,
        target_port: u16,
        originator: SocketAddr,
    ) -> Result<RemoteChannel, TunnelError> {
        HandleController::open_direct_tcpip(self, target_host, target_port, originator).await
    }

    fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        HandleController::subscribe_disconnect(self)
    }

    async fn disconnect(&self) {
        HandleController::disconnect(self).await
    }
}

/// The part of a session handle the owner task drives
#[async_trait]
trait OwnedSession: Send + Sync + 'static {
    type Channel: Send + 'static;

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Self::Channel, russh::Error>;

    fn session_closed(&self) -> bool;

    async fn close_session(&self);
}

#[async_trait]
impl OwnedSession for Handle<ClientHandler> {
    type Channel = Channel<Msg>;

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, russh::Error> {
        self.channel_open_direct_tcpip(host, port, originator_host, originator_port)
            .await
    }

    fn session_closed(&self) -> bool {
        self.is_closed()
    }

    async fn close_session(&self) {
        let _ = Handle::disconnect(self, russh::Disconnect::ByApplication, "Tunnel closed", "en")
            .await;
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes ownership of the Handle and returns a HandleController for sending commands.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    tunnel_id: String,
    channel_buffer: usize,
) -> HandleController {
    let (cmd_tx, cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);

    tokio::spawn(run_handle_owner(
        Arc::new(handle),
        tunnel_id,
        cmd_rx,
        disconnect_tx.clone(),
    ));

    HandleController {
        cmd_tx,
        disconnect_tx,
        channel_buffer,
    }
}

async fn run_handle_owner<S: OwnedSession>(
    session: Arc<S>,
    tunnel_id: String,
    mut cmd_rx: mpsc::Receiver<HandleCommand<S::Channel>>,
    disconnect_tx: broadcast::Sender<()>,
) {
    let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);
    let mut opens = JoinSet::new();

    info!("Handle owner task started for tunnel {}", tunnel_id);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(HandleCommand::ChannelOpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                }) => {
                    debug!(
                        "Opening direct-tcpip to {}:{} for {}:{}",
                        host, port, originator_host, originator_port
                    );
                    let session = session.clone();
                    opens.spawn(async move {
                        let result = session
                            .open_direct_tcpip(&host, port, &originator_host, originator_port)
                            .await;
                        if reply_tx.send(result).is_err() {
                            // Channel will be dropped, SSH server will close it
                            warn!("Caller dropped before receiving direct_tcpip result");
                        }
                    });
                }
                Some(HandleCommand::Disconnect) => {
                    info!("Disconnect requested for tunnel {}", tunnel_id);
                    break;
                }
                None => {
                    info!("All controllers dropped for tunnel {}", tunnel_id);
                    break;
                }
            },

            Some(_) = opens.join_next(), if !opens.is_empty() => {}

            _ = liveness.tick() => {
                if session.session_closed() {
                    warn!("SSH connection lost for tunnel {}", tunnel_id);
                    break;
                }
            }
        }
    }

    // Callers still waiting on an open see Disconnected
    opens.shutdown().await;

    // Notify subscribers (listener, relays); fails only without subscribers
    let _ = disconnect_tx.send(());

    drain_pending_commands(&mut cmd_rx);

    session.close_session().await;
    info!("Handle owner task terminated for tunnel {}", tunnel_id);
}

fn channel_open_error(err: russh::Error) -> TunnelError {
    match err {
        russh::Error::ChannelOpenFailure(russh::ChannelOpenFailure::UnknownChannelType) => {
            TunnelError::InvalidChannelType
        }
        russh::Error::Disconnect => TunnelError::Disconnected,
        other => TunnelError::ChannelError(other.to_string()),
    }
}

/// Drain all pending commands, returning Disconnected error to each
fn drain_pending_commands<C>(cmd_rx: &mut mpsc::Receiver<HandleCommand<C>>) {
    // Close receiver first, prevent new messages
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}
