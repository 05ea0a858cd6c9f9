//! # Packet Codec
//!
//! Length-prefixed, type-tagged binary encoding of [`TransferPacket`]s:
//!
//! ```text
//!  0        1        2        3        4        5
//! +--------+--------+--------+--------+--------+---------------
//! |  Tag   |          Length (u32 BE)          |  Payload ...
//! +--------+--------+--------+--------+--------+---------------
//! ```
//!
//! Decoding validates that the payload parses under the declared tag, so
//! a decoded packet is always safe to hand to typed accessors.

use thiserror::Error;

use crate::packet::{
    CommandPacket, HandshakeAck, HandshakeRequest, PacketType, TransferPacket, TunnelCloseNotice,
    TunnelDataPayload, TunnelOpenAck, TunnelOpenRequest,
};

/// Tag byte plus the u32 payload length.
pub const HEADER_LEN: usize = 5;

/// Hard cap on a single packet's payload.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Errors produced by [`encode`] and [`decode`].
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("malformed packet: unknown tag 0x{0:02x}")]
    MalformedPacket(u8),

    #[error("truncated packet: need {needed} bytes, have {got}")]
    Truncated { needed: usize, got: usize },

    #[error("frame of {0} bytes exceeds the payload cap")]
    FrameTooLarge(usize),

    #[error("payload does not parse as {packet_type}: {detail}")]
    PayloadTypeMismatch {
        packet_type: &'static str,
        detail: String,
    },
}

// ─── Encode ─────────────────────────────────────────────────────

/// Serializes a packet into its wire form.
///
/// Fails when the payload exceeds [`MAX_PAYLOAD`] or when a
/// [`PacketType::JsonCommand`] packet is missing its command envelope.
pub fn encode(packet: &TransferPacket) -> Result<Vec<u8>, CodecError> {
    if packet.payload.len() > MAX_PAYLOAD {
        return Err(CodecError::Encode(format!(
            "payload of {} bytes exceeds the {} byte cap",
            packet.payload.len(),
            MAX_PAYLOAD
        )));
    }
    if packet.packet_type == PacketType::JsonCommand && packet.command.is_none() {
        return Err(CodecError::Encode(
            "json_command packet without a command envelope".into(),
        ));
    }

    let mut out = Vec::with_capacity(HEADER_LEN + packet.payload.len());
    out.push(packet.packet_type.tag());
    out.extend_from_slice(&(packet.payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&packet.payload);
    Ok(out)
}

// ─── Decode ─────────────────────────────────────────────────────

/// Reads the frame header, returning `(packet_type, payload_len)`.
///
/// Used by streaming transports to size their payload read.
pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<(PacketType, usize), CodecError> {
    let packet_type =
        PacketType::from_tag(header[0]).ok_or(CodecError::MalformedPacket(header[0]))?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(CodecError::FrameTooLarge(len));
    }
    Ok((packet_type, len))
}

/// Deserializes a packet from a complete buffer.
pub fn decode(buf: &[u8]) -> Result<TransferPacket, CodecError> {
    if buf.len() < HEADER_LEN {
        return Err(CodecError::Truncated {
            needed: HEADER_LEN,
            got: buf.len(),
        });
    }
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&buf[..HEADER_LEN]);
    let (packet_type, len) = decode_header(&header)?;
    if buf.len() < HEADER_LEN + len {
        return Err(CodecError::Truncated {
            needed: HEADER_LEN + len,
            got: buf.len(),
        });
    }
    packet_from_parts(packet_type, buf[HEADER_LEN..HEADER_LEN + len].to_vec())
}

/// Builds a validated [`TransferPacket`] from a tag and raw payload bytes.
///
/// This is the single place payload/type agreement is checked; the HLP
/// envelope path reuses it for packets that arrive outside the binary
/// framing.
pub fn packet_from_parts(
    packet_type: PacketType,
    payload: Vec<u8>,
) -> Result<TransferPacket, CodecError> {
    let command = match packet_type {
        PacketType::JsonCommand => Some(
            serde_json::from_slice::<CommandPacket>(&payload).map_err(|e| {
                CodecError::PayloadTypeMismatch {
                    packet_type: "json_command",
                    detail: e.to_string(),
                }
            })?,
        ),
        PacketType::Handshake => {
            check_json::<HandshakeRequest>(&payload, "handshake")?;
            None
        }
        PacketType::HandshakeResponse => {
            check_json::<HandshakeAck>(&payload, "handshake_response")?;
            None
        }
        PacketType::TunnelOpen => {
            check_json::<TunnelOpenRequest>(&payload, "tunnel_open")?;
            None
        }
        PacketType::TunnelOpenAck => {
            check_json::<TunnelOpenAck>(&payload, "tunnel_open_ack")?;
            None
        }
        PacketType::TunnelClose => {
            check_json::<TunnelCloseNotice>(&payload, "tunnel_close")?;
            None
        }
        PacketType::TunnelData => {
            TunnelDataPayload::from_bytes(&payload)?;
            None
        }
        // Heartbeat payloads are opaque (usually empty).
        PacketType::Heartbeat => None,
    };

    Ok(TransferPacket {
        packet_type,
        payload,
        command,
    })
}

fn check_json<T: serde::de::DeserializeOwned>(
    payload: &[u8],
    name: &'static str,
) -> Result<(), CodecError> {
    serde_json::from_slice::<T>(payload)
        .map(|_| ())
        .map_err(|e| CodecError::PayloadTypeMismatch {
            packet_type: name,
            detail: e.to_string(),
        })
}
