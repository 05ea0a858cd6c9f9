//! # Connections
//!
//! One [`Connection`] exists per attached agent link, regardless of
//! transport. It owns the transport's packet stream exclusively and walks
//! the handshake-to-ready lifecycle; everything else (bridges, fan-out)
//! refers to connections by id and resolves them through the session
//! manager on use.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tunnox_protocol::packet::TransferPacket;

use crate::stream::{PacketStream, StreamError};

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initializing,
    HandshakeInProgress,
    Authenticated,
    TunnelOpen,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Initializing => "initializing",
            ConnectionState::HandshakeInProgress => "handshake_in_progress",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::TunnelOpen => "tunnel_open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Transport that produced the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    WebSocket,
    Quic,
    Hlp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Tcp => "tcp",
            TransportKind::WebSocket => "websocket",
            TransportKind::Quic => "quic",
            TransportKind::Hlp => "hlp",
        };
        f.write_str(name)
    }
}

/// A live agent link.
pub struct Connection {
    id: String,
    client_id: AtomicI64,
    protocol: TransportKind,
    state: Mutex<ConnectionState>,
    stream: Arc<dyn PacketStream>,
    remote_addr: String,
    created_at: Instant,
    last_seen: Mutex<Instant>,
    malformed_strikes: AtomicU32,
}

impl Connection {
    pub fn new(
        id: impl Into<String>,
        protocol: TransportKind,
        stream: Arc<dyn PacketStream>,
        remote_addr: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            client_id: AtomicI64::new(0),
            protocol,
            state: Mutex::new(ConnectionState::Initializing),
            stream,
            remote_addr: remote_addr.into(),
            created_at: Instant::now(),
            last_seen: Mutex::new(Instant::now()),
            malformed_strikes: AtomicU32::new(0),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client_id(&self) -> i64 {
        self.client_id.load(Ordering::Acquire)
    }

    pub fn set_client_id(&self, client_id: i64) {
        self.client_id.store(client_id, Ordering::Release);
    }

    pub fn protocol(&self) -> TransportKind {
        self.protocol
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("connection state poisoned")
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock().expect("connection state poisoned") = state;
    }

    pub fn stream(&self) -> &Arc<dyn PacketStream> {
        &self.stream
    }

    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn touch(&self) {
        *self.last_seen.lock().expect("last_seen poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().expect("last_seen poisoned").elapsed()
    }

    /// Records one malformed packet; returns the running count.
    pub fn strike(&self) -> u32 {
        self.malformed_strikes.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Enqueues a packet on the owned stream.
    pub async fn send(&self, packet: TransferPacket) -> Result<usize, StreamError> {
        self.stream.write_packet(packet).await
    }

    /// Closes the owned stream and marks the connection closed.
    pub async fn close(&self) {
        self.set_state(ConnectionState::Closed);
        self.stream.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed || self.stream.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ChannelStream;

    #[tokio::test]
    async fn lifecycle_walks_through_states() {
        let (stream, _in_tx, _out_rx) = ChannelStream::new(4);
        let conn = Connection::new("conn_t0000000", TransportKind::Tcp, stream, "1.2.3.4:5");

        assert_eq!(conn.state(), ConnectionState::Initializing);
        conn.set_state(ConnectionState::HandshakeInProgress);
        conn.set_state(ConnectionState::Authenticated);
        assert_eq!(conn.state(), ConnectionState::Authenticated);

        conn.close().await;
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn strikes_accumulate() {
        let (stream, _in_tx, _out_rx) = ChannelStream::new(4);
        let conn = Connection::new("conn_t0000001", TransportKind::Hlp, stream, "");
        assert_eq!(conn.strike(), 1);
        assert_eq!(conn.strike(), 2);
        assert_eq!(conn.strike(), 3);
    }
}
