//! Stream-Pair Splicer
//!
//! Relays bytes between two streams (a local TCP socket and a forwarded SSH
//! channel) in both directions.
//!
//! # Architecture
//!
//! ```text
//!   local stream ──read──▶ [pump] ──mailbox──▶ [sink] ──write──▶ remote stream
//!   local stream ◀─write── [sink] ◀──mailbox── [pump] ◀──read─── remote stream
//!        └──────── local endpoint task ──┘   └── remote endpoint task ──┘
//! ```
//!
//! Each endpoint runs in its own task and only knows its partner through the
//! sending half of the partner's bounded mailbox. A read is issued only after
//! a mailbox slot has been reserved, so a slow writer stalls the opposite
//! reader instead of buffering without bound.
//!
//! End-of-stream on one side becomes a write-side shutdown on the other.
//! A full close travels through the mailbox behind any data read before it,
//! so the partner writes out everything queued and then closes the pair. An
//! error cancels the pair's [`PairCloser`] at once, tearing down both
//! endpoints.

use std::future::Future;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::ssh::TunnelError;

/// Read buffer size for socket endpoints
const READ_CHUNK: usize = 32 * 1024;

/// Result of one read on an endpoint's stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Bytes),
    /// Peer finished sending; the other direction may stay open
    Eof,
    /// Peer closed the stream entirely
    Closed,
}

#[async_trait]
pub trait EndpointReader: Send {
    async fn read(&mut self) -> Result<ReadOutcome, TunnelError>;
}

#[async_trait]
pub trait EndpointWriter: Send {
    async fn write(&mut self, data: Bytes) -> Result<(), TunnelError>;

    async fn flush(&mut self) -> Result<(), TunnelError>;

    /// Half-close: no more data will be written
    async fn shutdown_output(&mut self) -> Result<(), TunnelError>;

    /// Full close. Called once when the endpoint stops; dropping the writer
    /// must release whatever is left.
    async fn close(&mut self) {}
}

/// A stream that can take part in a splice
pub trait SpliceStream: Send + 'static {
    type Reader: EndpointReader + 'static;
    type Writer: EndpointWriter + 'static;

    fn into_split(self) -> (Self::Reader, Self::Writer);
}

/// Adapts any tokio byte stream (TcpStream, DuplexStream, ...) for splicing
pub struct IoEndpoint<S>(S);

impl<S> IoEndpoint<S> {
    pub fn new(stream: S) -> Self {
        Self(stream)
    }
}

pub struct IoReader<S> {
    inner: ReadHalf<S>,
    buf: BytesMut,
}

pub struct IoWriter<S> {
    inner: BufWriter<WriteHalf<S>>,
}

impl<S> SpliceStream for IoEndpoint<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Reader = IoReader<S>;
    type Writer = IoWriter<S>;

    fn into_split(self) -> (IoReader<S>, IoWriter<S>) {
        let (read, write) = tokio::io::split(self.0);
        (
            IoReader {
                inner: read,
                buf: BytesMut::with_capacity(READ_CHUNK),
            },
            IoWriter {
                inner: BufWriter::new(write),
            },
        )
    }
}

#[async_trait]
impl<S> EndpointReader for IoReader<S>
where
    S: AsyncRead + Send + Unpin,
{
    async fn read(&mut self) -> Result<ReadOutcome, TunnelError> {
        self.buf.reserve(READ_CHUNK);
        match self.inner.read_buf(&mut self.buf).await? {
            0 => Ok(ReadOutcome::Eof),
            _ => Ok(ReadOutcome::Data(self.buf.split().freeze())),
        }
    }
}

#[async_trait]
impl<S> EndpointWriter for IoWriter<S>
where
    S: AsyncWrite + Send + Unpin,
{
    async fn write(&mut self, data: Bytes) -> Result<(), TunnelError> {
        self.inner.write_all(&data).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), TunnelError> {
        self.inner.flush().await?;
        Ok(())
    }

    async fn shutdown_output(&mut self) -> Result<(), TunnelError> {
        // Flushes the buffer before shutting down the write side
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Shared close signal for one channel pair.
///
/// Closing is idempotent; every clone observes the same state.
#[derive(Debug, Clone, Default)]
pub struct PairCloser {
    token: CancellationToken,
}

impl PairCloser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

/// Message carried between the two endpoints of a pair
#[derive(Debug)]
enum Relayed {
    Data(Bytes),
    Eof,
    /// Partner's stream closed; write out what is queued, then close the pair
    Close,
}

/// How an endpoint stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Both directions reached end-of-stream
    Completed,
    /// Torn down by its partner or by the owner of the pair
    Closed,
    /// This endpoint hit an error and closed the pair
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointReport {
    pub name: &'static str,
    /// Bytes read from this endpoint's stream
    pub bytes_read: u64,
    /// Bytes written to this endpoint's stream
    pub bytes_written: u64,
    /// Reads postponed because the partner's mailbox was full
    pub deferred_reads: u64,
    pub outcome: CloseReason,
}

impl EndpointReport {
    fn aborted(name: &'static str, reason: String) -> Self {
        Self {
            name,
            bytes_read: 0,
            bytes_written: 0,
            deferred_reads: 0,
            outcome: CloseReason::Failed(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpliceReport {
    pub local: EndpointReport,
    pub remote: EndpointReport,
}

impl SpliceReport {
    /// Bytes carried from the local stream to the remote one
    pub fn bytes_to_remote(&self) -> u64 {
        self.local.bytes_read
    }

    /// Bytes carried from the remote stream to the local one
    pub fn bytes_to_local(&self) -> u64 {
        self.remote.bytes_read
    }

    pub fn failed(&self) -> bool {
        matches!(self.local.outcome, CloseReason::Failed(_))
            || matches!(self.remote.outcome, CloseReason::Failed(_))
    }
}

/// One side of a channel pair
pub struct GlueEndpoint {
    name: &'static str,
    inbox: mpsc::Receiver<Relayed>,
    /// Partner's mailbox; only a handle, never ownership of the partner
    partner: Option<mpsc::Sender<Relayed>>,
}

/// Create two endpoints that address each other
pub fn matched_pair(
    names: (&'static str, &'static str),
    capacity: usize,
) -> (GlueEndpoint, GlueEndpoint) {
    let capacity = capacity.max(1);
    let (first_tx, first_rx) = mpsc::channel(capacity);
    let (second_tx, second_rx) = mpsc::channel(capacity);
    (
        GlueEndpoint {
            name: names.0,
            inbox: first_rx,
            partner: Some(second_tx),
        },
        GlueEndpoint {
            name: names.1,
            inbox: second_rx,
            partner: Some(first_tx),
        },
    )
}

#[derive(Default)]
struct Counters {
    bytes_read: u64,
    bytes_written: u64,
    deferred_reads: u64,
}

enum Leg {
    Finished,
    Cancelled,
}

impl GlueEndpoint {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Relay between `stream` and the partner until both directions end or
    /// the pair is closed. The stream is released before this returns.
    pub async fn run<S: SpliceStream>(self, stream: S, closer: PairCloser) -> EndpointReport {
        let GlueEndpoint {
            name,
            mut inbox,
            partner,
        } = self;
        let (mut reader, mut writer) = stream.into_split();
        let mut counters = Counters::default();

        let outcome = {
            let Counters {
                bytes_read,
                bytes_written,
                deferred_reads,
            } = &mut counters;

            let pumped = guarded(
                name,
                "read",
                &closer,
                pump(name, &mut reader, partner, bytes_read, deferred_reads),
            );
            let sunk = guarded(
                name,
                "write",
                &closer,
                sink(name, &mut writer, &mut inbox, &closer, bytes_written),
            );

            match tokio::join!(pumped, sunk) {
                (Err(e), _) | (_, Err(e)) => CloseReason::Failed(e.to_string()),
                (Ok(Leg::Finished), Ok(Leg::Finished)) => CloseReason::Completed,
                _ => CloseReason::Closed,
            }
        };

        // Stop accepting messages; partner sees this as a departed endpoint
        inbox.close();
        writer.close().await;
        drop(reader);
        drop(writer);

        debug!(
            "{} endpoint stopped ({:?}): {} bytes in, {} bytes out",
            name, outcome, counters.bytes_read, counters.bytes_written
        );

        EndpointReport {
            name,
            bytes_read: counters.bytes_read,
            bytes_written: counters.bytes_written,
            deferred_reads: counters.deferred_reads,
            outcome,
        }
    }
}

/// Run one direction until it finishes, fails, or the pair is closed.
/// A failure closes the pair.
async fn guarded<F>(
    name: &'static str,
    direction: &'static str,
    closer: &PairCloser,
    leg: F,
) -> Result<Leg, TunnelError>
where
    F: Future<Output = Result<Leg, TunnelError>>,
{
    tokio::select! {
        biased;
        _ = closer.closed() => Ok(Leg::Cancelled),
        result = leg => match result {
            Ok(leg) => Ok(leg),
            Err(e) => {
                debug!("{} endpoint {} failed: {}", name, direction, e);
                closer.close();
                Err(e)
            }
        },
    }
}

/// Read from our stream into the partner's mailbox
async fn pump<R: EndpointReader>(
    name: &'static str,
    reader: &mut R,
    partner: Option<mpsc::Sender<Relayed>>,
    bytes_read: &mut u64,
    deferred_reads: &mut u64,
) -> Result<Leg, TunnelError> {
    let Some(partner) = partner else {
        return Ok(Leg::Finished);
    };

    loop {
        let permit = match partner.try_reserve() {
            Ok(permit) => permit,
            Err(TrySendError::Full(())) => {
                // Pending read: wait for the partner to drain
                *deferred_reads += 1;
                trace!("{}: partner not writable, deferring read", name);
                match partner.reserve().await {
                    Ok(permit) => {
                        trace!("{}: partner writable, issuing deferred read", name);
                        permit
                    }
                    Err(_) => return Ok(Leg::Finished),
                }
            }
            // Partner already gone
            Err(TrySendError::Closed(())) => return Ok(Leg::Finished),
        };

        match reader.read().await? {
            ReadOutcome::Data(data) => {
                *bytes_read += data.len() as u64;
                permit.send(Relayed::Data(data));
            }
            ReadOutcome::Eof => {
                debug!("{}: end of input, half-closing partner", name);
                permit.send(Relayed::Eof);
                return Ok(Leg::Finished);
            }
            ReadOutcome::Closed => {
                // The partner closes the pair once it has written this out
                debug!("{}: stream closed, closing pair after queued data", name);
                permit.send(Relayed::Close);
                return Ok(Leg::Finished);
            }
        }
    }
}

/// Write everything the partner sends to our stream, flushing once per batch
async fn sink<W: EndpointWriter>(
    name: &'static str,
    writer: &mut W,
    inbox: &mut mpsc::Receiver<Relayed>,
    closer: &PairCloser,
    bytes_written: &mut u64,
) -> Result<Leg, TunnelError> {
    while let Some(first) = inbox.recv().await {
        let mut next = Some(first);
        while let Some(message) = next.take() {
            match message {
                Relayed::Data(data) => {
                    let len = data.len() as u64;
                    writer.write(data).await?;
                    *bytes_written += len;
                }
                Relayed::Eof => {
                    writer.flush().await?;
                    writer.shutdown_output().await?;
                    trace!("{}: output shut down", name);
                    return Ok(Leg::Finished);
                }
                Relayed::Close => {
                    writer.flush().await?;
                    debug!("{}: partner closed, closing pair", name);
                    closer.close();
                    return Ok(Leg::Cancelled);
                }
            }
            next = inbox.try_recv().ok();
        }
        writer.flush().await?;
    }
    Ok(Leg::Finished)
}

/// Splice two streams until both directions finish or the pair is closed.
///
/// Each endpoint runs on its own task; `closer` tears down both.
pub async fn splice<A, B>(local: A, remote: B, capacity: usize, closer: PairCloser) -> SpliceReport
where
    A: SpliceStream,
    B: SpliceStream,
{
    let (local_end, remote_end) = matched_pair(("local", "remote"), capacity);
    let local_task = tokio::spawn(local_end.run(local, closer.clone()));
    let remote_task = tokio::spawn(remote_end.run(remote, closer.clone()));

    let (local, remote) = tokio::join!(local_task, remote_task);
    SpliceReport {
        local: local.unwrap_or_else(|e| {
            closer.close();
            EndpointReport::aborted("local", e.to_string())
        }),
        remote: remote.unwrap_or_else(|e| {
            closer.close();
            EndpointReport::aborted("remote", e.to_string())
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};

    /// Splice two in-memory pipes; returns the outer ends
    fn spliced(
        capacity: usize,
        pipe: usize,
    ) -> (
        DuplexStream,
        DuplexStream,
        PairCloser,
        tokio::task::JoinHandle<SpliceReport>,
    ) {
        let (local_outer, local_inner) = duplex(pipe);
        let (remote_outer, remote_inner) = duplex(pipe);
        let closer = PairCloser::new();
        let task = tokio::spawn(splice(
            IoEndpoint::new(local_inner),
            IoEndpoint::new(remote_inner),
            capacity,
            closer.clone(),
        ));
        (local_outer, remote_outer, closer, task)
    }

    struct FailingReader;
    struct DiscardWriter;
    struct FailingStream;

    #[async_trait]
    impl EndpointReader for FailingReader {
        async fn read(&mut self) -> Result<ReadOutcome, TunnelError> {
            Err(TunnelError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset by peer",
            )))
        }
    }

    #[async_trait]
    impl EndpointWriter for DiscardWriter {
        async fn write(&mut self, _data: Bytes) -> Result<(), TunnelError> {
            Ok(())
        }
        async fn flush(&mut self) -> Result<(), TunnelError> {
            Ok(())
        }
        async fn shutdown_output(&mut self) -> Result<(), TunnelError> {
            Ok(())
        }
    }

    impl SpliceStream for FailingStream {
        type Reader = FailingReader;
        type Writer = DiscardWriter;

        fn into_split(self) -> (FailingReader, DiscardWriter) {
            (FailingReader, DiscardWriter)
        }
    }

    #[tokio::test]
    async fn test_relays_both_directions_in_order() {
        let (mut local, mut remote, _closer, _task) = spliced(4, 1024);

        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            for chunk in payload.chunks(700) {
                local.write_all(chunk).await.unwrap();
            }
            local
        });

        let mut received = vec![0u8; expected.len()];
        remote.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);

        let mut local = writer.await.unwrap();
        remote.write_all(b"PONG").await.unwrap();
        let mut reply = [0u8; 4];
        local.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"PONG");
    }

    #[tokio::test]
    async fn test_half_close_keeps_other_direction_open() {
        let (mut local, mut remote, _closer, task) = spliced(4, 1024);

        local.write_all(b"request").await.unwrap();
        local.shutdown().await.unwrap();

        let mut request = Vec::new();
        remote.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"request");

        // Remote can still answer after the local side half-closed
        remote.write_all(b"response").await.unwrap();
        remote.shutdown().await.unwrap();

        let mut response = Vec::new();
        local.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"response");

        let report = task.await.unwrap();
        assert_eq!(report.local.outcome, CloseReason::Completed);
        assert_eq!(report.remote.outcome, CloseReason::Completed);
        assert_eq!(report.bytes_to_remote(), 7);
        assert_eq!(report.bytes_to_local(), 8);
    }

    #[tokio::test]
    async fn test_backpressure_defers_reads() {
        let (mut local, mut remote, _closer, task) = spliced(1, 64);

        let total = 64 * 1024;
        let writer = tokio::spawn(async move {
            local.write_all(&vec![7u8; total]).await.unwrap();
            local.shutdown().await.unwrap();
            local
        });

        // Let the local side run ahead of a remote reader that is not reading
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), total);
        assert!(received.iter().all(|b| *b == 7));

        remote.shutdown().await.unwrap();
        drop(writer.await.unwrap());

        let report = task.await.unwrap();
        assert_eq!(report.bytes_to_remote(), total as u64);
        assert!(report.local.deferred_reads > 0);
    }

    #[tokio::test]
    async fn test_error_closes_partner() {
        let (mut remote_outer, remote_inner) = duplex(1024);
        let report =
            splice(FailingStream, IoEndpoint::new(remote_inner), 4, PairCloser::new()).await;

        assert!(matches!(report.local.outcome, CloseReason::Failed(_)));
        assert_eq!(report.remote.outcome, CloseReason::Closed);
        assert!(report.failed());

        // Remote stream was fully closed
        let mut rest = Vec::new();
        assert_eq!(remote_outer.read_to_end(&mut rest).await.unwrap(), 0);
    }

    /// Yields the scripted reads, then reports a full close
    struct ScriptedReader(std::collections::VecDeque<&'static [u8]>);
    struct ScriptedStream(&'static [&'static [u8]]);

    #[async_trait]
    impl EndpointReader for ScriptedReader {
        async fn read(&mut self) -> Result<ReadOutcome, TunnelError> {
            Ok(match self.0.pop_front() {
                Some(chunk) => ReadOutcome::Data(Bytes::from_static(chunk)),
                None => ReadOutcome::Closed,
            })
        }
    }

    impl SpliceStream for ScriptedStream {
        type Reader = ScriptedReader;
        type Writer = DiscardWriter;

        fn into_split(self) -> (ScriptedReader, DiscardWriter) {
            (ScriptedReader(self.0.iter().copied().collect()), DiscardWriter)
        }
    }

    #[tokio::test]
    async fn test_data_before_close_is_delivered() {
        for _ in 0..20 {
            let (mut local_outer, local_inner) = duplex(1024);
            let report = splice(
                IoEndpoint::new(local_inner),
                ScriptedStream(&[b"hel", b"lo"]),
                4,
                PairCloser::new(),
            )
            .await;

            let mut received = Vec::new();
            local_outer.read_to_end(&mut received).await.unwrap();
            assert_eq!(received, b"hello");
            assert_eq!(report.bytes_to_local(), 5);
            assert_eq!(report.local.bytes_written, 5);
            assert!(!report.failed());
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut local, mut remote, closer, task) = spliced(4, 1024);

        closer.close();
        closer.close();
        assert!(closer.is_closed());

        let report = task.await.unwrap();
        assert_eq!(report.local.outcome, CloseReason::Closed);
        assert_eq!(report.remote.outcome, CloseReason::Closed);

        let mut buf = Vec::new();
        assert_eq!(local.read_to_end(&mut buf).await.unwrap(), 0);
        assert_eq!(remote.read_to_end(&mut buf).await.unwrap(), 0);

        // Closing after teardown changes nothing
        closer.close();
    }

    #[tokio::test]
    async fn test_departed_partner_is_noop() {
        let (endpoint, partner) = matched_pair(("a", "b"), 2);
        drop(partner);

        let (_outer, inner) = duplex(64);
        let report = endpoint.run(IoEndpoint::new(inner), PairCloser::new()).await;
        assert_eq!(report.outcome, CloseReason::Completed);
        assert_eq!(report.bytes_read, 0);
        assert_eq!(report.bytes_written, 0);
    }
}
