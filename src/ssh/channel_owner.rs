//! Channel Owner Tasks
//!
//! Same single-owner pattern as the handle owner, applied to each half of a
//! `russh::Channel`: one task owns the read half, another owns the write
//! half, and everything else talks to them through queues.
//!
//! The halves run independently so a write waiting for send window never
//! stops the reader from draining the channel. The session only processes
//! the server's window adjustments while incoming messages are being taken.
//!
//! The reader stops pulling from the channel while the inbound queue is full,
//! which pushes back on the server.

use bytes::Bytes;
use russh::client::Msg;
use russh::{Channel, ChannelMsg, ChannelReadHalf, ChannelWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::transport::{ChannelCommand, ChannelEnvelope, RemoteChannel};

/// Spawn the owner tasks for `channel` and return their queue ends
pub fn spawn_channel_owner(channel: Channel<Msg>, buffer: usize) -> RemoteChannel {
    let buffer = buffer.max(1);
    let (inbound_tx, inbound_rx) = mpsc::channel::<ChannelEnvelope>(buffer);
    let (outbound_tx, outbound_rx) = mpsc::channel::<ChannelCommand>(buffer);
    let label = format!("channel-{}", channel.id());

    let (read_half, write_half) = channel.split();
    tokio::spawn(write_loop(label.clone(), write_half, outbound_rx));
    tokio::spawn(read_loop(label.clone(), read_half, inbound_tx));

    RemoteChannel::new(label, inbound_rx, outbound_tx)
}

/// Execute outbound commands until `Close` or until the writer is dropped
async fn write_loop(
    label: String,
    half: ChannelWriteHalf<Msg>,
    mut outbound: mpsc::Receiver<ChannelCommand>,
) {
    while let Some(cmd) = outbound.recv().await {
        match cmd {
            ChannelCommand::Data(data) => {
                if let Err(e) = half.data(&data[..]).await {
                    debug!("{}: write failed: {}", label, e);
                    break;
                }
            }
            ChannelCommand::Eof => {
                trace!("{}: sending EOF", label);
                if let Err(e) = half.eof().await {
                    debug!("{}: EOF failed: {}", label, e);
                }
            }
            ChannelCommand::Close => break,
        }
    }

    if let Err(e) = half.close().await {
        // Already closed by the server
        debug!("{}: close failed: {}", label, e);
    }
    debug!("{}: writer exited", label);
}

/// Relay server messages into the inbound queue until the channel closes or
/// the reader goes away
async fn read_loop(
    label: String,
    mut half: ChannelReadHalf,
    inbound: mpsc::Sender<ChannelEnvelope>,
) {
    loop {
        // Take nothing from the server until the reader has room for it
        let Ok(permit) = inbound.reserve().await else {
            debug!("{}: reader dropped", label);
            break;
        };

        let msg = tokio::select! {
            msg = half.wait() => msg,
            _ = inbound.closed() => {
                debug!("{}: reader dropped", label);
                break;
            }
        };

        let envelope = match msg {
            Some(ChannelMsg::Data { data }) => ChannelEnvelope::Data(Bytes::copy_from_slice(&data)),
            Some(ChannelMsg::ExtendedData { data, ext }) => ChannelEnvelope::ExtendedData {
                code: ext,
                data: Bytes::copy_from_slice(&data),
            },
            Some(ChannelMsg::Eof) => ChannelEnvelope::Eof,
            Some(ChannelMsg::Close) | None => {
                permit.send(ChannelEnvelope::Close);
                break;
            }
            // Window adjustments, request replies: nothing to relay
            Some(_) => continue,
        };
        permit.send(envelope);
    }
    debug!("{}: reader exited", label);
}
