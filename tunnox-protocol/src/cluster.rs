//! # Cluster Frames
//!
//! Node-to-node wire format for the cross-node stream bridge. Peer nodes
//! keep a small pool of long-lived TCP links; each link multiplexes many
//! logical streams identified by `stream_id`. Frames are bincode-encoded
//! behind a u32 length prefix.
//!
//! Besides forwarded streams, two lightweight RPCs ride the same link:
//! `Ping` (liveness) and `NodeInfo` (peer stats).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Frames larger than this are rejected outright.
pub const MAX_FRAME_LEN: usize = 17 * 1024 * 1024;

/// u32 length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum ClusterCodecError {
    #[error("cluster frame of {0} bytes exceeds the cap")]
    FrameTooLarge(usize),

    #[error("cluster frame does not decode: {0}")]
    Malformed(String),
}

/// Type of a [`ClusterFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterFrameType {
    /// Opens a logical stream; payload is a [`StreamOpenPayload`].
    StreamOpen,
    /// Accepts or rejects a stream; payload is a [`StreamAckPayload`].
    StreamAck,
    /// Forwarded bytes for an open stream.
    StreamData,
    /// Closes a logical stream.
    StreamClose,
    /// Liveness probe; payload is a [`PingPayload`].
    Ping,
    /// Probe answer; payload is a [`PongPayload`].
    Pong,
    /// Peer stats request; payload is a [`NodeInfoRequest`].
    NodeInfoRequest,
    /// Peer stats answer; payload is a [`NodeInfoResponse`].
    NodeInfoResponse,
}

/// One frame on a node-to-node link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterFrame {
    /// Logical stream the frame belongs to; 0 for link-level RPCs.
    pub stream_id: u64,
    pub frame_type: ClusterFrameType,
    pub payload: Vec<u8>,
    pub timestamp_ms: u64,
}

impl ClusterFrame {
    pub fn new(stream_id: u64, frame_type: ClusterFrameType, payload: Vec<u8>) -> Self {
        Self {
            stream_id,
            frame_type,
            payload,
            timestamp_ms: 0,
        }
    }

    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }
}

// ─── RPC Payloads ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {
    pub node_id: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongPayload {
    pub ok: bool,
    pub server_timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfoRequest {
    pub node_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfoResponse {
    pub node_id: String,
    pub active_connections: u64,
    pub uptime_seconds: u64,
}

/// Payload of a [`ClusterFrameType::StreamOpen`] frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOpenPayload {
    pub mapping_id: String,
    pub target_client_id: i64,
    /// Node that initiated the forward, for logging and loop detection.
    pub source_node: String,
    /// Forwarded protocol, handed to the target agent's TunnelOpen.
    #[serde(default)]
    pub protocol: String,
}

/// Payload of a [`ClusterFrameType::StreamAck`] frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamAckPayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ─── Framing ────────────────────────────────────────────────────

/// Serializes a frame behind its u32 length prefix.
pub fn encode_frame(frame: &ClusterFrame) -> Result<Vec<u8>, ClusterCodecError> {
    let body = bincode::serialize(frame).map_err(|e| ClusterCodecError::Malformed(e.to_string()))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ClusterCodecError::FrameTooLarge(body.len()));
    }
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Reads the length prefix of a frame.
pub fn decode_frame_len(header: &[u8; FRAME_HEADER_LEN]) -> Result<usize, ClusterCodecError> {
    let len = u32::from_be_bytes(*header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ClusterCodecError::FrameTooLarge(len));
    }
    Ok(len)
}

/// Deserializes a frame body (the bytes after the length prefix).
pub fn decode_frame_body(body: &[u8]) -> Result<ClusterFrame, ClusterCodecError> {
    bincode::deserialize(body).map_err(|e| ClusterCodecError::Malformed(e.to_string()))
}

/// Helper for serializing RPC payloads.
pub fn encode_payload<T: Serialize>(payload: &T) -> Vec<u8> {
    bincode::serialize(payload).unwrap_or_default()
}

/// Helper for deserializing RPC payloads.
pub fn decode_payload<T: serde::de::DeserializeOwned>(
    payload: &[u8],
) -> Result<T, ClusterCodecError> {
    bincode::deserialize(payload).map_err(|e| ClusterCodecError::Malformed(e.to_string()))
}
