//! # QUIC Transport
//!
//! A quinn endpoint with a self-signed certificate; each agent opens one
//! bidirectional stream that carries the same length-prefixed framing as
//! the TCP transport. Agents are expected to skip verification against
//! this certificate or pin it out of band.

use std::sync::Arc;

use quinn::{Endpoint, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::session::connection::TransportKind;
use crate::session::SessionManager;
use crate::stream::FramedStream;

fn server_config() -> Result<ServerConfig, GatewayError> {
    // Both ring and aws-lc end up linked through the dependency graph;
    // pick one explicitly so rustls does not refuse to choose.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let certified = rcgen::generate_simple_self_signed(vec!["tunnox".to_string()])
        .map_err(|e| GatewayError::Io(format!("self-signed cert: {e}")))?;
    let cert: CertificateDer<'static> = certified.cert.into();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        certified.key_pair.serialize_der(),
    ));
    ServerConfig::with_single_cert(vec![cert], key)
        .map_err(|e| GatewayError::Io(format!("quic server config: {e}")))
}

/// Binds the QUIC endpoint and serves agent streams until shutdown.
pub async fn serve(sessions: Arc<SessionManager>, listen: &str) -> Result<(), GatewayError> {
    let addr = listen
        .parse()
        .map_err(|e| GatewayError::Io(format!("quic listen {listen}: {e}")))?;
    let endpoint = Endpoint::server(server_config()?, addr)
        .map_err(|e| GatewayError::Io(format!("quic bind {listen}: {e}")))?;
    info!(addr = %listen, "quic transport listening");

    while let Some(incoming) = endpoint.accept().await {
        let sessions = Arc::clone(&sessions);
        tokio::spawn(async move {
            let connection = match incoming.await {
                Ok(connection) => connection,
                Err(e) => {
                    warn!(error = %e, "quic handshake failed");
                    return;
                }
            };
            let remote = connection.remote_address().to_string();
            debug!(remote = %remote, "quic connection established");

            // Each bidirectional stream is an independent agent link.
            loop {
                match connection.accept_bi().await {
                    Ok((send, recv)) => {
                        let framed = Arc::new(FramedStream::new(recv, send));
                        sessions.register_stream(framed, TransportKind::Quic, &remote);
                    }
                    Err(e) => {
                        debug!(remote = %remote, reason = %e, "quic connection ended");
                        break;
                    }
                }
            }
        });
    }
    Ok(())
}
