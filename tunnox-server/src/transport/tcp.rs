//! # TCP Transport
//!
//! The simplest native transport: transfer packets ride the binary
//! length-prefixed framing straight on the socket. Each accepted
//! connection becomes a session-layer connection with a fresh server-
//! issued id.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::warn;

use crate::session::connection::TransportKind;
use crate::session::SessionManager;
use crate::stream::FramedStream;

/// Accept loop; runs until the listener fails.
pub async fn serve(sessions: Arc<SessionManager>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                let (read_half, write_half) = stream.into_split();
                let framed = Arc::new(FramedStream::new(read_half, write_half));
                sessions.register_stream(framed, TransportKind::Tcp, &peer.to_string());
            }
            Err(e) => {
                warn!(error = %e, "tcp accept failed");
                break;
            }
        }
    }
}
