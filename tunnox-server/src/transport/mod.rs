//! # Native Transports
//!
//! Besides the HLP fallback, agents attach over three native transports,
//! each of which hands the session layer a packet stream:
//!
//! - [`tcp`] — length-prefixed transfer packets on a plain socket
//! - [`ws`]  — binary WebSocket frames, one encoded packet per frame
//! - [`quic`] — one bidirectional QUIC stream per agent

pub mod quic;
pub mod tcp;
pub mod ws;

use tracing::info;

use crate::error::GatewayError;
use crate::state::AppState;

/// Binds and serves the configured native listeners (TCP, QUIC). The
/// WebSocket transport rides the HTTP router instead.
pub async fn spawn_native_listeners(state: &AppState) -> Result<(), GatewayError> {
    if !state.config.tcp_listen.is_empty() {
        let listener = tokio::net::TcpListener::bind(&state.config.tcp_listen)
            .await
            .map_err(|e| GatewayError::Io(format!("bind {}: {e}", state.config.tcp_listen)))?;
        info!(addr = %state.config.tcp_listen, "tcp transport listening");
        let sessions = state.sessions.clone();
        tokio::spawn(async move { tcp::serve(sessions, listener).await });
    }

    if !state.config.quic_listen.is_empty() {
        let sessions = state.sessions.clone();
        let listen = state.config.quic_listen.clone();
        tokio::spawn(async move {
            if let Err(e) = quic::serve(sessions, &listen).await {
                tracing::error!(error = %e, "quic transport failed");
            }
        });
    }

    Ok(())
}
