//! # WebSocket Transport
//!
//! Upgrades `GET /tunnox/v1/ws` and carries one encoded transfer packet
//! per binary frame. The socket is owned by two pump tasks bridging it to
//! a channel-backed packet stream; the session layer reads and writes
//! that stream like any other transport.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};
use tunnox_protocol::codec;

use crate::session::connection::TransportKind;
use crate::state::AppState;
use crate::stream::{ChannelStream, PacketStream};

/// `GET /tunnox/v1/ws` — upgrades to a WebSocket transport connection.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Runs one WebSocket connection: registers it with the session layer,
/// then pumps frames both ways until either side hangs up.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (stream, in_tx, mut out_rx) = ChannelStream::new(64);
    let conn =
        state
            .sessions
            .register_stream(stream.clone(), TransportKind::WebSocket, "websocket");

    let (mut sink, mut frames) = socket.split();

    // ── Outbound Pump ──
    // Serializes stream packets into binary frames.
    let outbound = tokio::spawn(async move {
        while let Some(packet) = out_rx.recv().await {
            let bytes = match codec::encode(&packet) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "unencodable outbound packet");
                    continue;
                }
            };
            if sink.send(Message::Binary(bytes.into())).await.is_err() {
                break;
            }
        }
    });

    // ── Inbound Pump ──
    // Decodes binary frames into stream packets; malformed frames count
    // toward the connection's strikes.
    while let Some(Ok(message)) = frames.next().await {
        match message {
            Message::Binary(bytes) => match codec::decode(&bytes) {
                Ok(packet) => {
                    if in_tx.send(packet).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    if state.sessions.note_malformed(&conn, &e.to_string()).await {
                        break;
                    }
                }
            },
            Message::Close(_) => break,
            // Pings are answered by axum; text frames are not part of
            // the protocol.
            _ => {}
        }
    }

    debug!(connection_id = %conn.id(), "websocket transport ended");
    outbound.abort();
    stream.close().await;
}
