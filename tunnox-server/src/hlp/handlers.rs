//! # HLP Endpoints
//!
//! The two stateless HTTP handlers implementing the long-polling wire:
//!
//! - `POST /tunnox/v1/push` — carries a fragment body and/or one control
//!   packet in the `X-Tunnel-Package` header
//! - `GET /tunnox/v1/poll?timeout=N` — parks until a fragment or control
//!   packet is ready, else answers a timeout
//!
//! All continuity lives in the stream processor; handlers only parse,
//! route, and shape responses. Control responses are never inlined into
//! push replies — they travel through the stream and surface on a poll.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::debug;
use tunnox_protocol::envelope::{
    FragmentBody, TunnelPackage, TunnelType, TUNNEL_PACKAGE_HEADER,
};

use super::processor::{HlpProcessor, PollOutcome};
use crate::error::GatewayError;
use crate::state::{now_millis, AppState};

/// Body of push acks and poll timeouts.
#[derive(Debug, Serialize)]
pub struct StatusBody {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: u64,
}

impl StatusBody {
    fn ok() -> Self {
        Self {
            success: true,
            timeout: None,
            error: None,
            timestamp: now_millis(),
        }
    }

    fn timed_out() -> Self {
        Self {
            success: true,
            timeout: Some(true),
            error: None,
            timestamp: now_millis(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PollParams {
    pub timeout: Option<u64>,
}

fn error_response(err: GatewayError) -> Response {
    let body = StatusBody {
        success: false,
        timeout: None,
        error: Some(format!("{}: {}", err.code(), err)),
        timestamp: now_millis(),
    };
    (err.status_code(), Json(body)).into_response()
}

fn parse_package(headers: &HeaderMap) -> Result<TunnelPackage, GatewayError> {
    let raw = headers
        .get(TUNNEL_PACKAGE_HEADER)
        .ok_or_else(|| GatewayError::InvalidEnvelope("missing X-Tunnel-Package".into()))?
        .to_str()
        .map_err(|_| GatewayError::InvalidEnvelope("header is not ascii".into()))?;
    Ok(TunnelPackage::decode_header(raw)?)
}

/// Looks up or creates the stream processor, registering a session
/// connection for fresh ones. Processors live in the server scope; the
/// request ending never cancels them.
fn obtain_processor(state: &AppState, package: &TunnelPackage) -> Arc<HlpProcessor> {
    let (processor, _created) = state.registry.get_or_create(&package.connection_id, || {
        let processor = Arc::new(HlpProcessor::new(
            &package.connection_id,
            state.config.fragment_size,
            state.config.write_queue_capacity,
            state.config.inbound_byte_budget,
        ));
        // Adopting inside the factory (registry lock, then session
        // manager lock) guarantees the session connection exists before
        // any racing request proceeds.
        state.sessions.adopt_hlp(Arc::clone(&processor));
        processor
    });
    processor
}

/// Counts a malformed-family error against the connection's strikes.
async fn note_strike(state: &AppState, connection_id: &str, err: &GatewayError) {
    if !err.is_strike() {
        return;
    }
    if let Some(conn) = state.sessions.connection_by_id(connection_id) {
        state.sessions.note_malformed(&conn, &err.to_string()).await;
    }
}

// ─── Push ───────────────────────────────────────────────────────

/// `POST /tunnox/v1/push`
pub async fn push(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let package = match parse_package(&headers) {
        Ok(package) => package,
        Err(err) => return error_response(err),
    };
    let processor = obtain_processor(&state, &package);
    processor.bind_identity(package.client_id, &package.mapping_id);

    // Fragment body, if any: reassemble multi-fragment groups, push the
    // complete payload to the upper layer.
    if !body.is_empty() {
        let fragment_body: FragmentBody = match serde_json::from_slice(&body) {
            Ok(fragment_body) => fragment_body,
            Err(e) => {
                return error_response(GatewayError::InvalidEnvelope(format!(
                    "push body does not parse: {e}"
                )))
            }
        };
        match processor.accept_body(package.tunnel_type, &fragment_body) {
            Ok(complete) => {
                debug!(
                    connection_id = %package.connection_id,
                    tunnel_type = ?package.tunnel_type,
                    complete,
                    "push body accepted"
                );
            }
            Err(err) => {
                note_strike(&state, &package.connection_id, &err).await;
                if matches!(
                    err,
                    GatewayError::Fragment(
                        tunnox_protocol::fragment::FragmentError::ResourceExhausted { .. }
                    ) | GatewayError::ResourceExhausted(_)
                ) {
                    // Inbound buffer cap: the connection is closed.
                    if let Some(conn) = state.sessions.connection_by_id(&package.connection_id) {
                        state.sessions.close_connection(&conn, "inbound buffer cap").await;
                    }
                }
                return error_response(err);
            }
        }
    }

    // Carried control packet, if any: dispatch through the session
    // manager. Responses are enqueued on the stream, never inlined here.
    match package.take_packet() {
        Ok(Some(packet)) => {
            if let Some(conn) = state.sessions.connection_by_id(&package.connection_id) {
                state.sessions.handle_packet(&conn, packet).await;
            }
        }
        Ok(None) => {}
        Err(e) => {
            let err: GatewayError = e.into();
            note_strike(&state, &package.connection_id, &err).await;
            return error_response(err);
        }
    }

    (StatusCode::OK, Json(StatusBody::ok())).into_response()
}

// ─── Poll ───────────────────────────────────────────────────────

/// `GET /tunnox/v1/poll?timeout=N`
pub async fn poll(
    State(state): State<AppState>,
    Query(params): Query<PollParams>,
    headers: HeaderMap,
) -> Response {
    let package = match parse_package(&headers) {
        Ok(package) => package,
        Err(err) => return error_response(err),
    };
    let processor = obtain_processor(&state, &package);

    // Keepalive polls are data-only; other polls may also update the
    // connection's identity binding.
    if package.tunnel_type != TunnelType::Keepalive {
        processor.bind_identity(package.client_id, &package.mapping_id);
    }

    let deadline = Instant::now() + state.config.clamp_poll_timeout(params.timeout);
    let outcome = processor
        .handle_poll_request(deadline, &package.request_id, package.tunnel_type)
        .await;

    match outcome {
        PollOutcome::TimedOut | PollOutcome::Closed => {
            (StatusCode::OK, Json(StatusBody::timed_out())).into_response()
        }
        PollOutcome::Ready { fragment, control } => {
            let mut response = match fragment {
                Some(fragment) => {
                    let mut body = FragmentBody::from_fragment(&fragment);
                    body.success = Some(true);
                    body.timestamp = Some(now_millis());
                    (StatusCode::OK, Json(body)).into_response()
                }
                None => (StatusCode::OK, Json(StatusBody::ok())).into_response(),
            };

            if let Some(control) = control {
                let envelope = TunnelPackage {
                    connection_id: package.connection_id.clone(),
                    client_id: processor.client_id(),
                    mapping_id: processor.mapping_id(),
                    tunnel_type: package.tunnel_type,
                    request_id: package.request_id.clone(),
                    packet_type: None,
                    data: None,
                }
                .with_packet(&control);
                if let Ok(value) = HeaderValue::from_str(&envelope.encode_header()) {
                    response
                        .headers_mut()
                        .insert(HeaderName::from_static(TUNNEL_PACKAGE_HEADER), value);
                }
            }
            response
        }
    }
}
