//! # Error Taxonomy
//!
//! Every failure the gateway surfaces maps to one of these kinds, each
//! with a stable code and an HTTP status for the HLP endpoints. Transport
//! and codec errors never cross the session boundary raw; they are coerced
//! here first.

use axum::http::StatusCode;
use thiserror::Error;
use tunnox_protocol::codec::CodecError;
use tunnox_protocol::envelope::EnvelopeError;
use tunnox_protocol::fragment::FragmentError;

/// Gateway-wide error kind.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Missing or malformed `X-Tunnel-Package`, bad connection id.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Poll or push against a connection the registry no longer holds.
    #[error("unknown connection {0}")]
    UnknownConnection(String),

    /// Handshake or token validation failed.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// TunnelOpen against a mapping the caller does not own.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// Bandwidth or connection caps exceeded.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error(transparent)]
    Fragment(#[from] FragmentError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Queue overflow or inbound buffer cap; closes the connection.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Cluster dial failure, broker timeout, peer agent offline.
    #[error("peer unavailable: {0}")]
    PeerUnavailable(String),

    /// Every node-pool link is at its stream cap.
    #[error("node pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("unsupported command {0}")]
    UnsupportedCommand(String),

    /// The stream or processor is closed.
    #[error("connection closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("i/o error: {0}")]
    Io(String),
}

impl GatewayError {
    /// HTTP status surfaced by the HLP endpoints.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::InvalidEnvelope(_)
            | GatewayError::Fragment(FragmentError::FragmentConflict(_))
            | GatewayError::Fragment(FragmentError::IndexOutOfRange { .. })
            | GatewayError::Fragment(FragmentError::DuplicateFragment { .. })
            | GatewayError::Codec(_) => StatusCode::BAD_REQUEST,
            GatewayError::UnknownConnection(_) => StatusCode::NOT_FOUND,
            GatewayError::Unauthorized(_) | GatewayError::NotAuthorized(_) => {
                StatusCode::FORBIDDEN
            }
            GatewayError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Fragment(FragmentError::ResourceExhausted { .. })
            | GatewayError::ResourceExhausted(_)
            | GatewayError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for acks and logs.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidEnvelope(_) => "invalid_envelope",
            GatewayError::UnknownConnection(_) => "unknown_connection",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::NotAuthorized(_) => "not_authorized",
            GatewayError::QuotaExceeded(_) => "quota_exceeded",
            GatewayError::Fragment(_) => "fragment_error",
            GatewayError::Codec(_) => "codec_error",
            GatewayError::ResourceExhausted(_) => "resource_exhausted",
            GatewayError::PeerUnavailable(_) => "peer_unavailable",
            GatewayError::PoolExhausted(_) => "pool_exhausted",
            GatewayError::UnsupportedCommand(_) => "unsupported_command",
            GatewayError::Closed => "closed",
            GatewayError::Cancelled => "cancelled",
            GatewayError::DeadlineExceeded => "deadline_exceeded",
            GatewayError::Io(_) => "io_error",
        }
    }

    /// True for the malformed-packet family that counts toward the
    /// three-strike connection close.
    pub fn is_strike(&self) -> bool {
        matches!(
            self,
            GatewayError::Codec(_)
                | GatewayError::Fragment(FragmentError::FragmentConflict(_))
                | GatewayError::Fragment(FragmentError::DuplicateFragment { .. })
                | GatewayError::Fragment(FragmentError::IndexOutOfRange { .. })
        )
    }
}

impl From<EnvelopeError> for GatewayError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::Codec(codec) => GatewayError::Codec(codec),
            other => GatewayError::InvalidEnvelope(other.to_string()),
        }
    }
}
