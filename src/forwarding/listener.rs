//! Local Forwarding Listener
//!
//! Accepts connections on a local address and hands each one to a
//! [`ConnectionForwarder`], which opens the remote side and starts the relay.
//! Example: forward localhost:15432 -> db.internal:5432 through SSH.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ssh::TunnelError;

/// Per-connection constructor: wires one accepted socket to the remote side.
///
/// Dropping `stream` on error closes the local connection.
#[async_trait]
pub trait ConnectionForwarder: Send + Sync + 'static {
    async fn forward(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), TunnelError>;
}

/// A bound listener
pub struct LocalForwardListener {
    /// Actual bound address (port differs from the requested one if it was 0)
    bound_addr: SocketAddr,
    running: Arc<AtomicBool>,
    stop_tx: Option<mpsc::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl LocalForwardListener {
    /// Bind `host:port` and start accepting.
    ///
    /// The accept loop also stops when `disconnect_rx` fires.
    pub async fn bind<F: ConnectionForwarder>(
        host: &str,
        port: u16,
        forwarder: Arc<F>,
        mut disconnect_rx: broadcast::Receiver<()>,
    ) -> Result<Self, TunnelError> {
        let addr = format!("{}:{}", host, port);
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| bind_error(&addr, e))?;

        let bound_addr = listener.local_addr().map_err(|e| {
            TunnelError::ConnectionFailed(format!("Failed to get bound address: {}", e))
        })?;

        info!("Listening for forwarded connections on {}", bound_addr);

        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = disconnect_rx.recv() => {
                        info!("Listener on {} stopped: SSH disconnected", bound_addr);
                        break;
                    }

                    _ = stop_rx.recv() => {
                        info!("Listener on {} stopped by request", bound_addr);
                        break;
                    }

                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, peer_addr)) => {
                                if !running_clone.load(Ordering::SeqCst) {
                                    break;
                                }

                                // Disable Nagle's algorithm for low-latency forwarding
                                if let Err(e) = stream.set_nodelay(true) {
                                    warn!("Failed to set TCP_NODELAY: {}", e);
                                }

                                debug!("Accepted connection from {}", peer_addr);

                                let forwarder = forwarder.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = forwarder.forward(stream, peer_addr).await {
                                        warn!(
                                            "Forwarding connection from {} failed: {}",
                                            peer_addr, e
                                        );
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Accept error: {}", e);
                                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                            }
                        }
                    }
                }
            }

            running_clone.store(false, Ordering::SeqCst);
            debug!("Listener task for {} exited", bound_addr);
        });

        Ok(Self {
            bound_addr,
            running,
            stop_tx: Some(stop_tx),
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    pub fn local_port(&self) -> u16 {
        self.bound_addr.port()
    }

    /// Check if the listener is still accepting
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop accepting and release the socket. Repeated calls are no-ops.
    pub async fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(stop_tx) = self.stop_tx.take() {
            // Fails only when the loop already exited (disconnect)
            let _ = stop_tx.send(()).await;
        }
        if let Some(task) = self.task.take() {
            // The socket is released when the task drops the listener
            let _ = task.await;
        }
    }
}

impl Drop for LocalForwardListener {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn bind_error(addr: &str, e: std::io::Error) -> TunnelError {
    match e.kind() {
        std::io::ErrorKind::AddrInUse => TunnelError::ConnectionFailed(format!(
            "Port already in use: {}. Another application may be using this port.",
            addr
        )),
        std::io::ErrorKind::PermissionDenied => TunnelError::ConnectionFailed(format!(
            "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
            addr
        )),
        std::io::ErrorKind::AddrNotAvailable => TunnelError::ConnectionFailed(format!(
            "Address not available: {}. The specified address is not valid on this system.",
            addr
        )),
        _ => TunnelError::ConnectionFailed(format!("Failed to bind to {}: {}", addr, e)),
    }
}
