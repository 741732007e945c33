//! Channel-Data Adapter
//!
//! Presents a forwarded SSH channel as a spliceable stream. Only ordinary
//! channel data is valid on a `direct-tcpip` channel; extended data fails
//! the read, which closes the pair.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::warn;

use super::splice::{EndpointReader, EndpointWriter, ReadOutcome, SpliceStream};
use crate::ssh::{ChannelCommand, ChannelEnvelope, RemoteChannel, TunnelError};

pub struct ChannelDataReader {
    label: String,
    inbound: mpsc::Receiver<ChannelEnvelope>,
}

pub struct ChannelDataWriter {
    outbound: mpsc::Sender<ChannelCommand>,
    closed: bool,
}

impl ChannelDataWriter {
    async fn send(&self, command: ChannelCommand) -> Result<(), TunnelError> {
        self.outbound
            .send(command)
            .await
            .map_err(|_| TunnelError::ChannelError("channel already closed".to_string()))
    }
}

#[async_trait]
impl EndpointReader for ChannelDataReader {
    async fn read(&mut self) -> Result<ReadOutcome, TunnelError> {
        match self.inbound.recv().await {
            Some(ChannelEnvelope::Data(data)) => Ok(ReadOutcome::Data(data)),
            Some(ChannelEnvelope::ExtendedData { code, data }) => {
                warn!(
                    "{}: unexpected extended data (type {}, {} bytes)",
                    self.label,
                    code,
                    data.len()
                );
                Err(TunnelError::InvalidData)
            }
            Some(ChannelEnvelope::Eof) => Ok(ReadOutcome::Eof),
            Some(ChannelEnvelope::Close) | None => Ok(ReadOutcome::Closed),
        }
    }
}

#[async_trait]
impl EndpointWriter for ChannelDataWriter {
    async fn write(&mut self, data: Bytes) -> Result<(), TunnelError> {
        self.send(ChannelCommand::Data(data)).await
    }

    async fn flush(&mut self) -> Result<(), TunnelError> {
        // Each message is handed to the channel owner as it is written
        Ok(())
    }

    async fn shutdown_output(&mut self) -> Result<(), TunnelError> {
        self.send(ChannelCommand::Eof).await
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // A full queue is fine: dropping the sender closes the channel too
        let _ = self.outbound.try_send(ChannelCommand::Close);
    }
}

impl SpliceStream for RemoteChannel {
    type Reader = ChannelDataReader;
    type Writer = ChannelDataWriter;

    fn into_split(self) -> (ChannelDataReader, ChannelDataWriter) {
        (
            ChannelDataReader {
                label: self.label,
                inbound: self.inbound,
            },
            ChannelDataWriter {
                outbound: self.outbound,
                closed: false,
            },
        )
    }
}
