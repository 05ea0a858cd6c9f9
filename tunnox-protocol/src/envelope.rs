//! # HLP Tunnel Package
//!
//! The HTTP long-polling transport wraps everything in a *tunnel package*:
//! a JSON envelope carried base64url-encoded in the `X-Tunnel-Package`
//! header of `push` and `poll` exchanges. The envelope names the logical
//! connection and channel; request/response bodies carry fragment-shaped
//! JSON when tunnel bytes are moved.
//!
//! Control packets ride the envelope itself (`type` + base64 `data`),
//! which keeps the header small and the body free for fragments.

use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE as BASE64_URL};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::codec::{self, CodecError};
use crate::fragment::Fragment;
use crate::packet::{PacketType, TransferPacket};

/// Header carrying the base64url-encoded envelope, on requests and on
/// responses that deliver a control packet.
pub const TUNNEL_PACKAGE_HEADER: &str = "x-tunnel-package";

/// Longest accepted connection id.
pub const MAX_CONNECTION_ID_LEN: usize = 64;

// ─── Errors ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope is not valid base64")]
    InvalidBase64,

    #[error("envelope is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("invalid connection id {0:?}")]
    InvalidConnectionId(String),

    #[error("fragment body is missing {0}")]
    MissingField(&'static str),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

// ─── Connection Ids ─────────────────────────────────────────────

/// Checks the `^[A-Za-z0-9_-]+$`, ≤ 64 byte connection-id grammar.
pub fn validate_connection_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_CONNECTION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Issues a fresh server-side connection id: `conn_` + 12 hex characters.
pub fn generate_connection_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("conn_{}", &uuid[..12])
}

// ─── Tunnel Package ─────────────────────────────────────────────

/// The logical channel a package belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    /// Handshake, commands, tunnel-open and their responses.
    #[default]
    Control,
    /// Forwarded tunnel bytes for one mapping.
    Data,
    /// Heartbeats only.
    Keepalive,
}

/// The outer HLP envelope.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TunnelPackage {
    /// Server-issued connection id; see [`validate_connection_id`].
    pub connection_id: String,
    /// Zero until the handshake completes.
    #[serde(default)]
    pub client_id: i64,
    /// Empty on the control channel.
    #[serde(default)]
    pub mapping_id: String,
    #[serde(default)]
    pub tunnel_type: TunnelType,
    /// Client-chosen correlation token, echoed by the server.
    #[serde(default)]
    pub request_id: String,
    /// Present when the envelope also carries a control packet.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub packet_type: Option<PacketType>,
    /// Base64 payload of the carried control packet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl TunnelPackage {
    pub fn new(connection_id: impl Into<String>, tunnel_type: TunnelType) -> Self {
        Self {
            connection_id: connection_id.into(),
            tunnel_type,
            ..Self::default()
        }
    }

    /// Embeds a control packet into the envelope.
    pub fn with_packet(mut self, packet: &TransferPacket) -> Self {
        self.packet_type = Some(packet.packet_type);
        self.data = Some(BASE64.encode(&packet.payload));
        self
    }

    /// Extracts the carried control packet, if any, validating the payload
    /// under the declared type exactly like the binary codec does.
    pub fn take_packet(&self) -> Result<Option<TransferPacket>, EnvelopeError> {
        let Some(packet_type) = self.packet_type else {
            return Ok(None);
        };
        let payload = match &self.data {
            Some(data) => BASE64
                .decode(data)
                .map_err(|_| EnvelopeError::InvalidBase64)?,
            None => Vec::new(),
        };
        Ok(Some(codec::packet_from_parts(packet_type, payload)?))
    }

    /// Encodes the envelope for the `X-Tunnel-Package` header.
    pub fn encode_header(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        BASE64_URL.encode(json)
    }

    /// Parses and validates an `X-Tunnel-Package` header value.
    pub fn decode_header(raw: &str) -> Result<Self, EnvelopeError> {
        let json = BASE64_URL
            .decode(raw.trim())
            .map_err(|_| EnvelopeError::InvalidBase64)?;
        let package: TunnelPackage =
            serde_json::from_slice(&json).map_err(|e| EnvelopeError::InvalidJson(e.to_string()))?;
        if !validate_connection_id(&package.connection_id) {
            return Err(EnvelopeError::InvalidConnectionId(
                package.connection_id.clone(),
            ));
        }
        Ok(package)
    }
}

// ─── Fragment Bodies ────────────────────────────────────────────

/// The JSON body of a `push` request and of a fragment-bearing `poll`
/// response. Group fields may be omitted when `total_fragments == 1`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FragmentBody {
    /// Set on responses only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    /// Unix milliseconds; set on responses only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,

    /// Base64 fragment bytes.
    pub data: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment_group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_fragments: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
}

impl FragmentBody {
    /// Wraps a complete payload as a trivial single-fragment body.
    pub fn single(data: &[u8]) -> Self {
        Self {
            data: BASE64.encode(data),
            total_fragments: Some(1),
            ..Self::default()
        }
    }

    /// Wraps one emitted [`Fragment`].
    pub fn from_fragment(fragment: &Fragment) -> Self {
        Self {
            data: BASE64.encode(&fragment.data),
            fragment_group_id: Some(fragment.group_id.clone()),
            original_size: Some(fragment.original_size),
            fragment_size: Some(fragment.fragment_size),
            fragment_index: Some(fragment.fragment_index),
            total_fragments: Some(fragment.total_fragments),
            sequence_number: Some(fragment.sequence_number),
            ..Self::default()
        }
    }

    /// True when this body is one piece of a multi-fragment group.
    pub fn is_multi_fragment(&self) -> bool {
        self.total_fragments.unwrap_or(1) > 1
    }

    /// Decodes the base64 fragment bytes.
    pub fn decode_data(&self) -> Result<Vec<u8>, EnvelopeError> {
        BASE64
            .decode(&self.data)
            .map_err(|_| EnvelopeError::InvalidBase64)
    }

    /// Rebuilds the [`Fragment`] for the reassembler. Only valid for
    /// multi-fragment bodies, which must carry all group fields.
    pub fn to_fragment(&self) -> Result<Fragment, EnvelopeError> {
        let data = self.decode_data()?;
        Ok(Fragment {
            group_id: self
                .fragment_group_id
                .clone()
                .ok_or(EnvelopeError::MissingField("fragment_group_id"))?,
            original_size: self
                .original_size
                .ok_or(EnvelopeError::MissingField("original_size"))?,
            fragment_size: self
                .fragment_size
                .ok_or(EnvelopeError::MissingField("fragment_size"))?,
            fragment_index: self
                .fragment_index
                .ok_or(EnvelopeError::MissingField("fragment_index"))?,
            total_fragments: self
                .total_fragments
                .ok_or(EnvelopeError::MissingField("total_fragments"))?,
            sequence_number: self.sequence_number.unwrap_or_default(),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::split;
    use crate::packet::{HandshakeAck, TransferPacket};

    #[test]
    fn connection_id_grammar() {
        assert!(validate_connection_id("conn_abc12345"));
        assert!(validate_connection_id("A-Z_09"));
        assert!(!validate_connection_id(""));
        assert!(!validate_connection_id("bad id"));
        assert!(!validate_connection_id("dot.dot"));
        assert!(!validate_connection_id(&"x".repeat(65)));
    }

    #[test]
    fn generated_ids_satisfy_the_grammar() {
        for _ in 0..16 {
            let id = generate_connection_id();
            assert!(id.starts_with("conn_"));
            assert!(validate_connection_id(&id));
            assert!(id.len() >= "conn_".len() + 8);
        }
    }

    #[test]
    fn header_round_trips() {
        let package = TunnelPackage {
            connection_id: "conn_abc12345".into(),
            client_id: 42,
            mapping_id: "m1".into(),
            tunnel_type: TunnelType::Data,
            request_id: "req-9".into(),
            packet_type: None,
            data: None,
        };
        let decoded = TunnelPackage::decode_header(&package.encode_header()).unwrap();
        assert_eq!(decoded, package);
    }

    #[test]
    fn header_rejects_garbage_and_bad_ids() {
        assert!(matches!(
            TunnelPackage::decode_header("!!not-base64!!"),
            Err(EnvelopeError::InvalidBase64)
        ));

        let bad = TunnelPackage::new("spaced id", TunnelType::Control);
        assert!(matches!(
            TunnelPackage::decode_header(&bad.encode_header()),
            Err(EnvelopeError::InvalidConnectionId(_))
        ));
    }

    #[test]
    fn carried_packets_round_trip() {
        let packet = TransferPacket::handshake_response(&HandshakeAck {
            success: true,
            connection_id: "conn_abc12345".into(),
            client_id: 7,
            error: None,
        });
        let package =
            TunnelPackage::new("conn_abc12345", TunnelType::Control).with_packet(&packet);
        let header = package.encode_header();
        let restored = TunnelPackage::decode_header(&header)
            .unwrap()
            .take_packet()
            .unwrap()
            .unwrap();
        assert_eq!(restored, packet);
    }

    #[test]
    fn fragment_bodies_round_trip_through_json() {
        let frag = split(&[3u8; 200], 64).remove(1);
        let body = FragmentBody::from_fragment(&frag);
        let json = serde_json::to_string(&body).unwrap();
        let parsed: FragmentBody = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.to_fragment().unwrap(), frag);
    }

    #[test]
    fn trivial_bodies_may_omit_group_fields() {
        let body: FragmentBody =
            serde_json::from_str(r#"{"data":"aGVsbG8=","total_fragments":1}"#).unwrap();
        assert!(!body.is_multi_fragment());
        assert_eq!(body.decode_data().unwrap(), b"hello");
    }
}
