//! # Transfer Packets
//!
//! Defines the packet envelope carried by every transport (TCP, WebSocket,
//! QUIC, and the HTTP long-polling fallback): a one-byte type tag plus an
//! opaque payload whose interpretation depends on the tag. Control-plane
//! payloads are JSON documents; tunnel data rides a compact binary framing
//! so forwarded bytes are never re-encoded.

use serde::{Deserialize, Serialize};

use crate::codec::CodecError;

// ─── Packet Types ───────────────────────────────────────────────

/// Every packet on the wire starts with one of these tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketType {
    /// Agent → server credential presentation; opens the control channel.
    Handshake,
    /// Server → agent verdict on a [`PacketType::Handshake`].
    HandshakeResponse,
    /// A correlated command request or response; payload is a
    /// [`CommandPacket`] JSON document.
    JsonCommand,
    /// Request to open (or attach to) the tunnel of a mapping.
    TunnelOpen,
    /// Server → agent verdict on a [`PacketType::TunnelOpen`].
    TunnelOpenAck,
    /// Forwarded tunnel bytes for one mapping.
    TunnelData,
    /// Tears down the tunnel of a mapping.
    TunnelClose,
    /// Liveness probe; refreshes the connection's `last_seen`.
    Heartbeat,
}

impl PacketType {
    /// Stable one-byte wire tag.
    pub fn tag(self) -> u8 {
        match self {
            PacketType::Handshake => 0x01,
            PacketType::HandshakeResponse => 0x02,
            PacketType::JsonCommand => 0x03,
            PacketType::TunnelOpen => 0x04,
            PacketType::TunnelOpenAck => 0x05,
            PacketType::TunnelData => 0x06,
            PacketType::TunnelClose => 0x07,
            PacketType::Heartbeat => 0x08,
        }
    }

    /// Inverse of [`PacketType::tag`].
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0x01 => PacketType::Handshake,
            0x02 => PacketType::HandshakeResponse,
            0x03 => PacketType::JsonCommand,
            0x04 => PacketType::TunnelOpen,
            0x05 => PacketType::TunnelOpenAck,
            0x06 => PacketType::TunnelData,
            0x07 => PacketType::TunnelClose,
            0x08 => PacketType::Heartbeat,
            _ => return None,
        })
    }

    /// True for packet types that belong to the control plane (everything
    /// except forwarded tunnel bytes and heartbeats).
    pub fn is_control(self) -> bool {
        !matches!(self, PacketType::TunnelData | PacketType::Heartbeat)
    }
}

// ─── Command Envelope ───────────────────────────────────────────

/// Typed commands carried inside a [`PacketType::JsonCommand`] packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    /// Push a new mapping configuration to an agent.
    ConfigSet,
    /// Ask an agent for its current configuration.
    ConfigGet,
    /// Force-disconnect an agent from the cluster.
    KickClient,
    /// Tear down every tunnel of one mapping.
    DisconnectMapping,
    /// No-op command used to probe the command channel.
    HealthCheck,
}

/// The command envelope: a correlated request or response.
///
/// `command_id` is set by the requester and echoed verbatim on the
/// response, which is how the two are matched. `command_body` carries a
/// JSON-encoded sub-type that only the matching handler interprets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPacket {
    pub command_id: String,
    pub command_type: CommandType,
    pub command_body: String,
}

// ─── Typed Payloads ─────────────────────────────────────────────

/// Payload of a [`PacketType::Handshake`] packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Client id the agent claims; validated against the auth store.
    pub client_id: i64,
    /// Credential for the claimed client id.
    pub auth_token: String,
    /// Connection id the agent wants to keep (e.g. an HLP connection it
    /// already polled on). The server issues one when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Agent software version, for diagnostics only.
    #[serde(default)]
    pub version: String,
}

/// Payload of a [`PacketType::HandshakeResponse`] packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub success: bool,
    /// The connection id the server bound this control channel to.
    pub connection_id: String,
    pub client_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload of a [`PacketType::TunnelOpen`] packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelOpenRequest {
    pub mapping_id: String,
    /// Forwarded protocol: "tcp", "udp" or "socks5".
    #[serde(default)]
    pub protocol: String,
}

/// Payload of a [`PacketType::TunnelOpenAck`] packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelOpenAck {
    pub mapping_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload of a [`PacketType::TunnelClose`] packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelCloseNotice {
    pub mapping_id: String,
    #[serde(default)]
    pub reason: String,
}

// ─── Tunnel Data Framing ────────────────────────────────────────

/// Payload of a [`PacketType::TunnelData`] packet.
///
/// Forwarded bytes stay binary: a u16 length-prefixed mapping id followed
/// by the raw data. One control connection multiplexes the tunnels of
/// several mappings, so every data packet names its mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelDataPayload {
    pub mapping_id: String,
    pub data: Vec<u8>,
}

impl TunnelDataPayload {
    pub fn new(mapping_id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mapping_id: mapping_id.into(),
            data,
        }
    }

    /// Serializes to `[u16 BE mapping_id len][mapping_id][data]`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let id = self.mapping_id.as_bytes();
        let mut out = Vec::with_capacity(2 + id.len() + self.data.len());
        out.extend_from_slice(&(id.len() as u16).to_be_bytes());
        out.extend_from_slice(id);
        out.extend_from_slice(&self.data);
        out
    }

    /// Inverse of [`TunnelDataPayload::to_bytes`].
    pub fn from_bytes(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 2 {
            return Err(CodecError::PayloadTypeMismatch {
                packet_type: "tunnel_data",
                detail: "missing mapping id length".into(),
            });
        }
        let id_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if buf.len() < 2 + id_len {
            return Err(CodecError::PayloadTypeMismatch {
                packet_type: "tunnel_data",
                detail: "mapping id shorter than declared".into(),
            });
        }
        let mapping_id = std::str::from_utf8(&buf[2..2 + id_len])
            .map_err(|_| CodecError::PayloadTypeMismatch {
                packet_type: "tunnel_data",
                detail: "mapping id is not utf-8".into(),
            })?
            .to_string();
        Ok(Self {
            mapping_id,
            data: buf[2 + id_len..].to_vec(),
        })
    }
}

// ─── Transfer Packet ────────────────────────────────────────────

/// The wire envelope every transport carries.
///
/// `payload` is the serialized typed payload for the given `packet_type`;
/// when the type is [`PacketType::JsonCommand`] the parsed command
/// envelope is also available as `command`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPacket {
    pub packet_type: PacketType,
    pub payload: Vec<u8>,
    pub command: Option<CommandPacket>,
}

impl TransferPacket {
    pub fn handshake(req: &HandshakeRequest) -> Self {
        Self {
            packet_type: PacketType::Handshake,
            payload: serde_json::to_vec(req).unwrap_or_default(),
            command: None,
        }
    }

    pub fn handshake_response(ack: &HandshakeAck) -> Self {
        Self {
            packet_type: PacketType::HandshakeResponse,
            payload: serde_json::to_vec(ack).unwrap_or_default(),
            command: None,
        }
    }

    pub fn json_command(cmd: CommandPacket) -> Self {
        Self {
            packet_type: PacketType::JsonCommand,
            payload: serde_json::to_vec(&cmd).unwrap_or_default(),
            command: Some(cmd),
        }
    }

    pub fn tunnel_open(req: &TunnelOpenRequest) -> Self {
        Self {
            packet_type: PacketType::TunnelOpen,
            payload: serde_json::to_vec(req).unwrap_or_default(),
            command: None,
        }
    }

    pub fn tunnel_open_ack(ack: &TunnelOpenAck) -> Self {
        Self {
            packet_type: PacketType::TunnelOpenAck,
            payload: serde_json::to_vec(ack).unwrap_or_default(),
            command: None,
        }
    }

    pub fn tunnel_data(payload: &TunnelDataPayload) -> Self {
        Self {
            packet_type: PacketType::TunnelData,
            payload: payload.to_bytes(),
            command: None,
        }
    }

    pub fn tunnel_close(notice: &TunnelCloseNotice) -> Self {
        Self {
            packet_type: PacketType::TunnelClose,
            payload: serde_json::to_vec(notice).unwrap_or_default(),
            command: None,
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            packet_type: PacketType::Heartbeat,
            payload: Vec::new(),
            command: None,
        }
    }

    /// Parses the payload as the typed document of `packet_type`.
    ///
    /// Returns `None` for types whose payloads are opaque or empty.
    pub fn parse_handshake(&self) -> Option<HandshakeRequest> {
        (self.packet_type == PacketType::Handshake)
            .then(|| serde_json::from_slice(&self.payload).ok())
            .flatten()
    }

    pub fn parse_handshake_ack(&self) -> Option<HandshakeAck> {
        (self.packet_type == PacketType::HandshakeResponse)
            .then(|| serde_json::from_slice(&self.payload).ok())
            .flatten()
    }

    pub fn parse_tunnel_open(&self) -> Option<TunnelOpenRequest> {
        (self.packet_type == PacketType::TunnelOpen)
            .then(|| serde_json::from_slice(&self.payload).ok())
            .flatten()
    }

    pub fn parse_tunnel_open_ack(&self) -> Option<TunnelOpenAck> {
        (self.packet_type == PacketType::TunnelOpenAck)
            .then(|| serde_json::from_slice(&self.payload).ok())
            .flatten()
    }

    pub fn parse_tunnel_data(&self) -> Option<TunnelDataPayload> {
        (self.packet_type == PacketType::TunnelData)
            .then(|| TunnelDataPayload::from_bytes(&self.payload).ok())
            .flatten()
    }

    pub fn parse_tunnel_close(&self) -> Option<TunnelCloseNotice> {
        (self.packet_type == PacketType::TunnelClose)
            .then(|| serde_json::from_slice(&self.payload).ok())
            .flatten()
    }
}
