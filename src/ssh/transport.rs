//! Transport capability consumed by the forwarding layer
//!
//! The listener and tunnel never touch russh directly: they only need to
//! open `direct-tcpip` channels, learn when the SSH connection goes away, and
//! tear it down. [`HandleController`](super::HandleController) implements this
//! against a live russh session; tests plug in an in-memory transport.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use super::error::TunnelError;

/// Message arriving on a logical channel from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEnvelope {
    /// Ordinary channel data
    Data(Bytes),
    /// Extended data (stderr-like streams); never valid on a forwarded channel
    ExtendedData { code: u32, data: Bytes },
    /// Server finished sending
    Eof,
    /// Channel closed
    Close,
}

/// Message sent on a logical channel to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCommand {
    Data(Bytes),
    Eof,
    Close,
}

/// A logical channel, reduced to its two message queues.
///
/// Whoever owns the underlying protocol object (see
/// [`spawn_channel_owner`](super::spawn_channel_owner)) drains `outbound`
/// and feeds `inbound`.
#[derive(Debug)]
pub struct RemoteChannel {
    /// Identifier for logs
    pub label: String,
    pub(crate) inbound: mpsc::Receiver<ChannelEnvelope>,
    pub(crate) outbound: mpsc::Sender<ChannelCommand>,
}

impl RemoteChannel {
    pub fn new(
        label: impl Into<String>,
        inbound: mpsc::Receiver<ChannelEnvelope>,
        outbound: mpsc::Sender<ChannelCommand>,
    ) -> Self {
        Self {
            label: label.into(),
            inbound,
            outbound,
        }
    }
}

/// Operations the forwarding layer needs from an SSH connection
#[async_trait]
pub trait ForwardingTransport: Clone + Send + Sync + 'static {
    /// Open a `direct-tcpip` channel to `target_host:target_port` on behalf of `originator`
    async fn open_direct_tcpip(
        &self,
        target_host: &str,
        target_port: u16,
        originator: SocketAddr,
    ) -> Result<RemoteChannel, TunnelError>;

    /// Receiver that fires once when the connection is gone
    fn subscribe_disconnect(&self) -> broadcast::Receiver<()>;

    /// Close the connection; repeated calls are harmless
    async fn disconnect(&self);
}
