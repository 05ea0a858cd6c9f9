//! # Node Links
//!
//! One [`NodeLink`] is a long-lived TCP connection to a peer node,
//! multiplexing many logical forward streams plus two link-level RPCs
//! (ping, node info). A writer task drains the outbound queue; a reader
//! task demultiplexes frames to per-stream channels or answers RPCs. An
//! I/O error on either side marks the link *broken*: routes are dropped,
//! which every open forward session observes as an abort.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use tunnox_protocol::cluster::{
    decode_frame_body, decode_frame_len, decode_payload, encode_frame, encode_payload,
    ClusterFrame, ClusterFrameType, NodeInfoRequest, NodeInfoResponse, PingPayload, PongPayload,
    FRAME_HEADER_LEN,
};

use crate::error::GatewayError;
use crate::state::now_millis;

/// Outbound frame queue depth per link.
const OUTBOUND_BUFFER: usize = 256;

/// Per-stream inbound channel depth.
const STREAM_BUFFER: usize = 256;

/// Link-level RPC deadline.
const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Reacts to peer-initiated streams and serves node info.
#[async_trait]
pub trait LinkHandler: Send + Sync {
    async fn on_stream_open(&self, link: &Arc<NodeLink>, frame: ClusterFrame);

    async fn node_info(&self) -> NodeInfoResponse;
}

/// A live link to one peer node.
pub struct NodeLink {
    peer_addr: String,
    outbound: mpsc::Sender<ClusterFrame>,
    /// stream id → inbound channel of that forward session.
    routes: DashMap<u64, mpsc::Sender<ClusterFrame>>,
    /// Initiator allocates odd ids, acceptor even, so the two sides never
    /// collide.
    next_stream_id: AtomicU64,
    active_streams: AtomicUsize,
    broken: AtomicBool,
    pending_pong: Mutex<Option<oneshot::Sender<PongPayload>>>,
    pending_node_info: Mutex<Option<oneshot::Sender<NodeInfoResponse>>>,
}

impl NodeLink {
    /// Dials a peer within `dial_timeout`.
    pub async fn connect(
        peer_addr: &str,
        dial_timeout: Duration,
        handler: Arc<dyn LinkHandler>,
    ) -> Result<Arc<Self>, GatewayError> {
        let stream = tokio::time::timeout(dial_timeout, TcpStream::connect(peer_addr))
            .await
            .map_err(|_| GatewayError::PeerUnavailable(format!("dial timeout to {peer_addr}")))?
            .map_err(|e| GatewayError::PeerUnavailable(format!("dial {peer_addr}: {e}")))?;
        Ok(Self::spawn(stream, peer_addr, 1, handler))
    }

    /// Wraps an accepted peer connection.
    pub fn accept(stream: TcpStream, handler: Arc<dyn LinkHandler>) -> Arc<Self> {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self::spawn(stream, &peer, 2, handler)
    }

    fn spawn(
        stream: TcpStream,
        peer_addr: &str,
        first_stream_id: u64,
        handler: Arc<dyn LinkHandler>,
    ) -> Arc<Self> {
        let (mut read_half, mut write_half) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::channel::<ClusterFrame>(OUTBOUND_BUFFER);

        let link = Arc::new(Self {
            peer_addr: peer_addr.to_string(),
            outbound: out_tx,
            routes: DashMap::new(),
            next_stream_id: AtomicU64::new(first_stream_id),
            active_streams: AtomicUsize::new(0),
            broken: AtomicBool::new(false),
            pending_pong: Mutex::new(None),
            pending_node_info: Mutex::new(None),
        });

        // Writer task: serialize and send queued frames.
        let writer_link = Arc::clone(&link);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let bytes = match encode_frame(&frame) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(peer = %writer_link.peer_addr, error = %e, "unencodable frame");
                        continue;
                    }
                };
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            writer_link.mark_broken();
        });

        // Reader task: demultiplex inbound frames.
        let reader_link = Arc::clone(&link);
        tokio::spawn(async move {
            loop {
                let mut header = [0u8; FRAME_HEADER_LEN];
                if read_half.read_exact(&mut header).await.is_err() {
                    break;
                }
                let len = match decode_frame_len(&header) {
                    Ok(len) => len,
                    Err(e) => {
                        warn!(peer = %reader_link.peer_addr, error = %e, "bad frame length");
                        break;
                    }
                };
                let mut body = vec![0u8; len];
                if read_half.read_exact(&mut body).await.is_err() {
                    break;
                }
                match decode_frame_body(&body) {
                    Ok(frame) => reader_link.dispatch(frame, &handler).await,
                    Err(e) => {
                        warn!(peer = %reader_link.peer_addr, error = %e, "undecodable frame");
                        break;
                    }
                }
            }
            reader_link.mark_broken();
        });

        link
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::Acquire)
    }

    /// Marks the link dead and drops every route, which each forward
    /// session observes as `Aborted`.
    pub fn mark_broken(&self) {
        if self.broken.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(peer = %self.peer_addr, "node link broken");
        self.routes.clear();
        self.pending_pong.lock().expect("pong slot poisoned").take();
        self.pending_node_info
            .lock()
            .expect("node info slot poisoned")
            .take();
    }

    pub async fn send_frame(&self, frame: ClusterFrame) -> Result<(), GatewayError> {
        if self.is_broken() {
            return Err(GatewayError::PeerUnavailable(format!(
                "link to {} is broken",
                self.peer_addr
            )));
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| GatewayError::PeerUnavailable(format!("link to {} closed", self.peer_addr)))
    }

    /// Allocates a fresh initiator-side stream and its inbound route.
    pub fn allocate_stream(&self) -> (u64, mpsc::Receiver<ClusterFrame>) {
        let stream_id = self.next_stream_id.fetch_add(2, Ordering::AcqRel);
        let rx = self.register_stream(stream_id);
        (stream_id, rx)
    }

    /// Installs the inbound route for a known stream id (acceptor side).
    pub fn register_stream(&self, stream_id: u64) -> mpsc::Receiver<ClusterFrame> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        self.routes.insert(stream_id, tx);
        self.active_streams.fetch_add(1, Ordering::AcqRel);
        rx
    }

    /// Drops a stream's route and load accounting. Idempotent.
    pub fn release_stream(&self, stream_id: u64) {
        if self.routes.remove(&stream_id).is_some() {
            self.active_streams.fetch_sub(1, Ordering::AcqRel);
        }
    }

    async fn dispatch(self: &Arc<Self>, frame: ClusterFrame, handler: &Arc<dyn LinkHandler>) {
        match frame.frame_type {
            ClusterFrameType::StreamOpen => handler.on_stream_open(self, frame).await,

            ClusterFrameType::StreamAck
            | ClusterFrameType::StreamData
            | ClusterFrameType::StreamClose => {
                let route = self.routes.get(&frame.stream_id).map(|r| r.value().clone());
                match route {
                    Some(tx) => {
                        if tx.send(frame).await.is_err() {
                            // Session is gone; stop routing to it.
                        }
                    }
                    None => {
                        debug!(
                            peer = %self.peer_addr,
                            stream_id = frame.stream_id,
                            "frame for unknown stream dropped"
                        );
                    }
                }
            }

            ClusterFrameType::Ping => {
                let pong = ClusterFrame::new(
                    frame.stream_id,
                    ClusterFrameType::Pong,
                    encode_payload(&PongPayload {
                        ok: true,
                        server_timestamp: now_millis(),
                    }),
                )
                .with_timestamp(now_millis());
                let _ = self.send_frame(pong).await;
            }

            ClusterFrameType::Pong => {
                if let Ok(pong) = decode_payload::<PongPayload>(&frame.payload) {
                    if let Some(waiter) = self
                        .pending_pong
                        .lock()
                        .expect("pong slot poisoned")
                        .take()
                    {
                        let _ = waiter.send(pong);
                    }
                }
            }

            ClusterFrameType::NodeInfoRequest => {
                let info = handler.node_info().await;
                let reply = ClusterFrame::new(
                    frame.stream_id,
                    ClusterFrameType::NodeInfoResponse,
                    encode_payload(&info),
                )
                .with_timestamp(now_millis());
                let _ = self.send_frame(reply).await;
            }

            ClusterFrameType::NodeInfoResponse => {
                if let Ok(info) = decode_payload::<NodeInfoResponse>(&frame.payload) {
                    if let Some(waiter) = self
                        .pending_node_info
                        .lock()
                        .expect("node info slot poisoned")
                        .take()
                    {
                        let _ = waiter.send(info);
                    }
                }
            }
        }
    }

    /// Link-level liveness probe. One outstanding ping per link; the
    /// health tick is the only caller.
    pub async fn ping(&self, node_id: &str) -> Result<PongPayload, GatewayError> {
        let (tx, rx) = oneshot::channel();
        *self.pending_pong.lock().expect("pong slot poisoned") = Some(tx);

        let frame = ClusterFrame::new(
            0,
            ClusterFrameType::Ping,
            encode_payload(&PingPayload {
                node_id: node_id.to_string(),
                timestamp: now_millis(),
            }),
        )
        .with_timestamp(now_millis());
        self.send_frame(frame).await?;

        tokio::time::timeout(RPC_TIMEOUT, rx)
            .await
            .map_err(|_| GatewayError::DeadlineExceeded)?
            .map_err(|_| GatewayError::PeerUnavailable("link lost awaiting pong".into()))
    }

    /// Asks the peer for its stats snapshot.
    pub async fn node_info(&self, node_id: &str) -> Result<NodeInfoResponse, GatewayError> {
        let (tx, rx) = oneshot::channel();
        *self
            .pending_node_info
            .lock()
            .expect("node info slot poisoned") = Some(tx);

        let frame = ClusterFrame::new(
            0,
            ClusterFrameType::NodeInfoRequest,
            encode_payload(&NodeInfoRequest {
                node_id: node_id.to_string(),
            }),
        )
        .with_timestamp(now_millis());
        self.send_frame(frame).await?;

        tokio::time::timeout(RPC_TIMEOUT, rx)
            .await
            .map_err(|_| GatewayError::DeadlineExceeded)?
            .map_err(|_| GatewayError::PeerUnavailable("link lost awaiting node info".into()))
    }
}
