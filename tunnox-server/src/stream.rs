//! # Packet Streams
//!
//! Every transport hands the session layer the same interface: an ordered,
//! full-duplex stream of [`TransferPacket`]s. TCP and QUIC use the binary
//! framing directly ([`FramedStream`]); WebSocket and HLP adapt their own
//! delivery models behind [`ChannelStream`] and the HLP stream processor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, Notify};
use tunnox_protocol::codec::{self, CodecError, HEADER_LEN};
use tunnox_protocol::packet::TransferPacket;

/// Errors surfaced by packet streams.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The stream is closed; no further packets will move.
    #[error("stream closed")]
    Closed,

    #[error("stream i/o error: {0}")]
    Io(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => StreamError::Closed,
            _ => StreamError::Io(err.to_string()),
        }
    }
}

/// The packet-streamer interface the session layer consumes.
///
/// `write_packet` returns the number of payload bytes buffered so callers
/// can account for throughput before fragmentation.
#[async_trait]
pub trait PacketStream: Send + Sync {
    async fn read_packet(&self) -> Result<TransferPacket, StreamError>;

    async fn write_packet(&self, packet: TransferPacket) -> Result<usize, StreamError>;

    /// Idempotent; wakes blocked readers and writers.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

// ─── Framed Byte Streams (TCP, QUIC) ────────────────────────────

/// Length-prefixed packet framing over any split byte stream.
pub struct FramedStream<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
    closed: AtomicBool,
}

impl<R, W> FramedStream<R, W>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<R, W> PacketStream for FramedStream<R, W>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    async fn read_packet(&self) -> Result<TransferPacket, StreamError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamError::Closed);
        }
        let mut reader = self.reader.lock().await;

        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).await?;
        let (packet_type, len) = codec::decode_header(&header)?;

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok(codec::packet_from_parts(packet_type, payload)?)
    }

    async fn write_packet(&self, packet: TransferPacket) -> Result<usize, StreamError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamError::Closed);
        }
        let buffered = packet.payload.len();
        let bytes = codec::encode(&packet)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(buffered)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// ─── Channel-Backed Streams (WebSocket) ─────────────────────────

/// A packet stream backed by a pair of channels, for transports whose
/// socket is owned by dedicated pump tasks (the teacher pattern for
/// WebSocket connections).
pub struct ChannelStream {
    inbound: Mutex<mpsc::Receiver<TransferPacket>>,
    outbound: mpsc::Sender<TransferPacket>,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl ChannelStream {
    /// Builds the stream plus the two channel ends its pump tasks drive:
    /// the sender feeds inbound packets, the receiver drains outbound.
    pub fn new(
        capacity: usize,
    ) -> (
        Arc<Self>,
        mpsc::Sender<TransferPacket>,
        mpsc::Receiver<TransferPacket>,
    ) {
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let stream = Arc::new(Self {
            inbound: Mutex::new(in_rx),
            outbound: out_tx,
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        });
        (stream, in_tx, out_rx)
    }
}

#[async_trait]
impl PacketStream for ChannelStream {
    async fn read_packet(&self) -> Result<TransferPacket, StreamError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamError::Closed);
        }
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            packet = inbound.recv() => packet.ok_or(StreamError::Closed),
            _ = self.closed_notify.notified() => Err(StreamError::Closed),
        }
    }

    async fn write_packet(&self, packet: TransferPacket) -> Result<usize, StreamError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamError::Closed);
        }
        let buffered = packet.payload.len();
        self.outbound
            .send(packet)
            .await
            .map_err(|_| StreamError::Closed)?;
        Ok(buffered)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.closed_notify.notify_waiters();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn framed_stream_round_trips_over_a_duplex_pipe() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (cr, cw) = tokio::io::split(client);
        let (sr, sw) = tokio::io::split(server);
        let a = FramedStream::new(cr, cw);
        let b = FramedStream::new(sr, sw);

        let packet = TransferPacket::heartbeat();
        a.write_packet(packet.clone()).await.unwrap();
        assert_eq!(b.read_packet().await.unwrap(), packet);
    }

    #[tokio::test]
    async fn framed_stream_reports_closed_after_close() {
        let (client, server) = tokio::io::duplex(1024);
        let (cr, cw) = tokio::io::split(client);
        let stream = FramedStream::new(cr, cw);
        drop(server);

        stream.close().await;
        assert!(stream.is_closed());
        assert!(matches!(
            stream.write_packet(TransferPacket::heartbeat()).await,
            Err(StreamError::Closed)
        ));
    }

    #[tokio::test]
    async fn channel_stream_moves_packets_both_ways() {
        let (stream, in_tx, mut out_rx) = ChannelStream::new(8);

        in_tx.send(TransferPacket::heartbeat()).await.unwrap();
        assert_eq!(
            stream.read_packet().await.unwrap(),
            TransferPacket::heartbeat()
        );

        stream.write_packet(TransferPacket::heartbeat()).await.unwrap();
        assert_eq!(out_rx.recv().await.unwrap(), TransferPacket::heartbeat());
    }

    #[tokio::test]
    async fn channel_stream_close_wakes_blocked_readers() {
        let (stream, _in_tx, _out_rx) = ChannelStream::new(8);
        let reader = {
            let stream = Arc::clone(&stream);
            tokio::spawn(async move { stream.read_packet().await })
        };
        tokio::task::yield_now().await;
        stream.close().await;
        assert!(matches!(reader.await.unwrap(), Err(StreamError::Closed)));
    }
}
