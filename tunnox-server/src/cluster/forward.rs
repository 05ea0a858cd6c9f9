//! # Forward Sessions
//!
//! One logical stream of tunnel bytes multiplexed on a node link. A
//! session opens with `STREAM_OPEN` → `STREAM_ACK`, carries ordered
//! `STREAM_DATA` frames, and ends with `STREAM_CLOSE` — or abruptly when
//! the parent link dies, which observers see as [`ForwardEvent::Aborted`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tunnox_protocol::cluster::{
    decode_payload, encode_payload, ClusterFrame, ClusterFrameType, StreamAckPayload,
    StreamOpenPayload,
};

use crate::bridge::RemoteEndpoint;
use crate::error::GatewayError;
use crate::state::now_millis;

use super::link::NodeLink;

/// What the session's reader observes next.
#[derive(Debug)]
pub enum ForwardEvent {
    /// Ordered forwarded bytes.
    Data(Vec<u8>),
    /// The peer closed the stream cleanly.
    Closed(String),
    /// The parent link died; the stream ends without a close.
    Aborted,
}

pub struct ForwardSession {
    stream_id: u64,
    mapping_id: String,
    link: Arc<NodeLink>,
    incoming: Mutex<mpsc::Receiver<ClusterFrame>>,
    finished: AtomicBool,
}

impl ForwardSession {
    /// Initiator side: sends `STREAM_OPEN` and waits for the ack.
    pub async fn open(
        link: &Arc<NodeLink>,
        open: StreamOpenPayload,
        ack_timeout: Duration,
    ) -> Result<Arc<Self>, GatewayError> {
        let (stream_id, mut rx) = link.allocate_stream();
        let mapping_id = open.mapping_id.clone();

        let frame = ClusterFrame::new(
            stream_id,
            ClusterFrameType::StreamOpen,
            encode_payload(&open),
        )
        .with_timestamp(now_millis());
        if let Err(e) = link.send_frame(frame).await {
            link.release_stream(stream_id);
            return Err(e);
        }

        let first = tokio::time::timeout(ack_timeout, rx.recv()).await;
        match first {
            Err(_) => {
                link.release_stream(stream_id);
                Err(GatewayError::PeerUnavailable("stream ack timed out".into()))
            }
            Ok(None) => {
                link.release_stream(stream_id);
                Err(GatewayError::PeerUnavailable("link lost before ack".into()))
            }
            Ok(Some(frame)) if frame.frame_type == ClusterFrameType::StreamAck => {
                let ack: StreamAckPayload = decode_payload(&frame.payload)
                    .map_err(|e| GatewayError::PeerUnavailable(e.to_string()))?;
                if !ack.success {
                    link.release_stream(stream_id);
                    return Err(GatewayError::PeerUnavailable(
                        ack.error.unwrap_or_else(|| "stream rejected".into()),
                    ));
                }
                Ok(Self::attach(stream_id, mapping_id, Arc::clone(link), rx))
            }
            Ok(Some(frame)) => {
                link.release_stream(stream_id);
                Err(GatewayError::PeerUnavailable(format!(
                    "unexpected {:?} before ack",
                    frame.frame_type
                )))
            }
        }
    }

    /// Acceptor side: wraps an already-acked stream.
    pub fn attach(
        stream_id: u64,
        mapping_id: String,
        link: Arc<NodeLink>,
        rx: mpsc::Receiver<ClusterFrame>,
    ) -> Arc<Self> {
        Arc::new(Self {
            stream_id,
            mapping_id,
            link,
            incoming: Mutex::new(rx),
            finished: AtomicBool::new(false),
        })
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn mapping_id(&self) -> &str {
        &self.mapping_id
    }

    fn finish(&self) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            self.link.release_stream(self.stream_id);
        }
    }

    /// Next event on the stream. Terminal events release the stream's
    /// slot on the parent link.
    pub async fn recv(&self) -> ForwardEvent {
        if self.finished.load(Ordering::Acquire) {
            return ForwardEvent::Aborted;
        }
        let mut incoming = self.incoming.lock().await;
        loop {
            match incoming.recv().await {
                None => {
                    self.finish();
                    return ForwardEvent::Aborted;
                }
                Some(frame) => match frame.frame_type {
                    ClusterFrameType::StreamData => return ForwardEvent::Data(frame.payload),
                    ClusterFrameType::StreamClose => {
                        self.finish();
                        return ForwardEvent::Closed(
                            String::from_utf8_lossy(&frame.payload).into_owned(),
                        );
                    }
                    // A duplicate ack or stray frame is not an event.
                    _ => continue,
                },
            }
        }
    }
}

#[async_trait]
impl RemoteEndpoint for ForwardSession {
    async fn send_data(&self, data: Vec<u8>) -> Result<(), GatewayError> {
        if self.finished.load(Ordering::Acquire) {
            return Err(GatewayError::Closed);
        }
        let frame = ClusterFrame::new(self.stream_id, ClusterFrameType::StreamData, data)
            .with_timestamp(now_millis());
        self.link.send_frame(frame).await
    }

    async fn send_close(&self, reason: &str) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        let frame = ClusterFrame::new(
            self.stream_id,
            ClusterFrameType::StreamClose,
            reason.as_bytes().to_vec(),
        )
        .with_timestamp(now_millis());
        let _ = self.link.send_frame(frame).await;
        self.finish();
    }
}
