//! # Tunnel Bridges
//!
//! A bridge joins the two endpoints of one mapping and forwards tunnel
//! data between them. Endpoints are opaque: a *local* end names a
//! connection id resolved through the session manager on every use (the
//! bridge never holds a connection reference), and a *remote* end wraps a
//! cross-node forward session. Per-direction token buckets enforce the
//! mapping's bandwidth cap; a per-mapping counter enforces its connection
//! cap.

pub mod limit;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};
use tunnox_protocol::packet::{TransferPacket, TunnelCloseNotice, TunnelDataPayload};

use crate::error::GatewayError;
use crate::session::connection::Connection;
use limit::RateLimiter;

/// Resolves connection ids to live connections. Implemented by the
/// session manager; the indirection keeps the bridge free of strong
/// references into the connection graph.
pub trait ConnectionResolver: Send + Sync {
    fn resolve(&self, connection_id: &str) -> Option<Arc<Connection>>;
}

/// The far half of a cross-node bridge.
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    async fn send_data(&self, data: Vec<u8>) -> Result<(), GatewayError>;

    async fn send_close(&self, reason: &str);
}

/// One side of a bridge.
#[derive(Clone)]
pub enum BridgeEnd {
    /// A connection on this node, by id.
    Local(String),
    /// A forward session to the peer node that owns the other agent.
    Remote(Arc<dyn RemoteEndpoint>),
}

impl BridgeEnd {
    fn is_local(&self, connection_id: &str) -> bool {
        matches!(self, BridgeEnd::Local(id) if id == connection_id)
    }
}

/// Counters exposed for the agents listing and tests.
#[derive(Debug, Clone)]
pub struct BridgeStats {
    pub mapping_id: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub conn_count: u32,
    pub opened_for: std::time::Duration,
}

/// A live bridge for one mapping.
pub struct TunnelBridge {
    mapping_id: String,
    /// The side that sent the first TunnelOpen.
    a: BridgeEnd,
    b: BridgeEnd,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    opened_at: Instant,
    conn_count: AtomicU32,
    /// 0 means unlimited.
    max_conns: u32,
    limit_ab: RateLimiter,
    limit_ba: RateLimiter,
    closed: AtomicBool,
}

impl TunnelBridge {
    pub fn new(mapping_id: impl Into<String>, bandwidth_bps: u64, max_conns: u32, a: BridgeEnd, b: BridgeEnd) -> Arc<Self> {
        Arc::new(Self {
            mapping_id: mapping_id.into(),
            a,
            b,
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            opened_at: Instant::now(),
            conn_count: AtomicU32::new(1),
            max_conns,
            limit_ab: RateLimiter::new(bandwidth_bps),
            limit_ba: RateLimiter::new(bandwidth_bps),
            closed: AtomicBool::new(false),
        })
    }

    pub fn mapping_id(&self) -> &str {
        &self.mapping_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn touches_connection(&self, connection_id: &str) -> bool {
        self.a.is_local(connection_id) || self.b.is_local(connection_id)
    }

    /// Attaches one more tunnel instance, enforcing `max_conns`.
    pub fn try_attach(&self) -> Result<(), GatewayError> {
        loop {
            let current = self.conn_count.load(Ordering::Acquire);
            if self.max_conns != 0 && current >= self.max_conns {
                return Err(GatewayError::QuotaExceeded(format!(
                    "mapping {} is at its cap of {} connections",
                    self.mapping_id, self.max_conns
                )));
            }
            if self
                .conn_count
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Detaches one tunnel instance; returns the remaining count.
    pub fn detach(&self) -> u32 {
        let previous = self.conn_count.fetch_sub(1, Ordering::AcqRel);
        previous.saturating_sub(1)
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            mapping_id: self.mapping_id.clone(),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            conn_count: self.conn_count.load(Ordering::Relaxed),
            opened_for: self.opened_at.elapsed(),
        }
    }

    /// Forwards bytes that arrived on a local connection toward the other
    /// side. No registry or bridge lock is held across the send.
    pub async fn forward_from_local(
        &self,
        resolver: &dyn ConnectionResolver,
        from_connection_id: &str,
        data: Vec<u8>,
    ) -> Result<(), GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::Closed);
        }
        let (target, limiter, counter) = if self.a.is_local(from_connection_id) {
            (&self.b, &self.limit_ab, &self.bytes_in)
        } else if self.b.is_local(from_connection_id) {
            (&self.a, &self.limit_ba, &self.bytes_out)
        } else {
            return Err(GatewayError::UnknownConnection(
                from_connection_id.to_string(),
            ));
        };

        limiter.acquire(data.len()).await;
        counter.fetch_add(data.len() as u64, Ordering::Relaxed);
        self.deliver(resolver, target, data).await
    }

    /// Forwards bytes that arrived from the remote half toward the local
    /// connection.
    pub async fn forward_from_remote(
        &self,
        resolver: &dyn ConnectionResolver,
        data: Vec<u8>,
    ) -> Result<(), GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::Closed);
        }
        let target = match (&self.a, &self.b) {
            (BridgeEnd::Local(_), BridgeEnd::Remote(_)) => &self.a,
            (BridgeEnd::Remote(_), BridgeEnd::Local(_)) => &self.b,
            _ => {
                return Err(GatewayError::PeerUnavailable(
                    "bridge has no local end".into(),
                ))
            }
        };
        self.limit_ba.acquire(data.len()).await;
        self.bytes_out.fetch_add(data.len() as u64, Ordering::Relaxed);
        self.deliver(resolver, target, data).await
    }

    async fn deliver(
        &self,
        resolver: &dyn ConnectionResolver,
        target: &BridgeEnd,
        data: Vec<u8>,
    ) -> Result<(), GatewayError> {
        match target {
            BridgeEnd::Local(connection_id) => {
                let conn = resolver.resolve(connection_id).ok_or_else(|| {
                    GatewayError::PeerUnavailable(format!("connection {connection_id} is gone"))
                })?;
                let packet = TransferPacket::tunnel_data(&TunnelDataPayload {
                    mapping_id: self.mapping_id.clone(),
                    data,
                });
                conn.send(packet)
                    .await
                    .map(|_| ())
                    .map_err(|e| GatewayError::PeerUnavailable(e.to_string()))
            }
            BridgeEnd::Remote(endpoint) => endpoint.send_data(data).await,
        }
    }

    /// Closes both directions: local ends receive a TunnelClose, the
    /// remote end (if any) receives a stream close. Idempotent.
    pub async fn shutdown(
        &self,
        resolver: &dyn ConnectionResolver,
        reason: &str,
        exclude_connection: Option<&str>,
    ) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(mapping_id = %self.mapping_id, reason, "closing tunnel bridge");

        let notice = TransferPacket::tunnel_close(&TunnelCloseNotice {
            mapping_id: self.mapping_id.clone(),
            reason: reason.to_string(),
        });

        for end in [&self.a, &self.b] {
            match end {
                BridgeEnd::Local(connection_id) => {
                    if exclude_connection == Some(connection_id.as_str()) {
                        continue;
                    }
                    if let Some(conn) = resolver.resolve(connection_id) {
                        if let Err(e) = conn.send(notice.clone()).await {
                            warn!(
                                mapping_id = %self.mapping_id,
                                connection_id = %connection_id,
                                error = %e,
                                "failed to deliver tunnel close"
                            );
                        }
                    }
                }
                BridgeEnd::Remote(endpoint) => endpoint.send_close(reason).await,
            }
        }
    }
}

// ─── Bridge Table ───────────────────────────────────────────────

/// All live bridges on this node, keyed by mapping id.
#[derive(Default)]
pub struct BridgeTable {
    by_mapping: DashMap<String, Arc<TunnelBridge>>,
}

impl BridgeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, mapping_id: &str) -> Option<Arc<TunnelBridge>> {
        self.by_mapping.get(mapping_id).map(|b| Arc::clone(b.value()))
    }

    pub fn insert(&self, bridge: Arc<TunnelBridge>) {
        self.by_mapping
            .insert(bridge.mapping_id().to_string(), bridge);
    }

    pub fn remove(&self, mapping_id: &str) -> Option<Arc<TunnelBridge>> {
        self.by_mapping.remove(mapping_id).map(|(_, b)| b)
    }

    /// Bridges with a local end on the given connection.
    pub fn find_by_connection(&self, connection_id: &str) -> Vec<Arc<TunnelBridge>> {
        self.by_mapping
            .iter()
            .filter(|b| b.touches_connection(connection_id))
            .map(|b| Arc::clone(b.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_mapping.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::connection::TransportKind;
    use crate::stream::ChannelStream;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    struct MapResolver(HashMap<String, Arc<Connection>>);

    impl ConnectionResolver for MapResolver {
        fn resolve(&self, connection_id: &str) -> Option<Arc<Connection>> {
            self.0.get(connection_id).cloned()
        }
    }

    fn local_conn(id: &str) -> (Arc<Connection>, mpsc::Receiver<TransferPacket>) {
        let (stream, _in_tx, out_rx) = ChannelStream::new(16);
        (
            Connection::new(id, TransportKind::Tcp, stream, "test"),
            out_rx,
        )
    }

    #[tokio::test]
    async fn data_flows_to_the_other_local_end() {
        let (conn_a, _rx_a) = local_conn("conn_aaaa0000");
        let (conn_b, mut rx_b) = local_conn("conn_bbbb0000");
        let resolver = MapResolver(HashMap::from([
            ("conn_aaaa0000".to_string(), Arc::clone(&conn_a)),
            ("conn_bbbb0000".to_string(), Arc::clone(&conn_b)),
        ]));

        let bridge = TunnelBridge::new(
            "m1",
            0,
            0,
            BridgeEnd::Local("conn_aaaa0000".into()),
            BridgeEnd::Local("conn_bbbb0000".into()),
        );
        bridge
            .forward_from_local(&resolver, "conn_aaaa0000", b"payload".to_vec())
            .await
            .unwrap();

        let packet = rx_b.recv().await.unwrap();
        let payload = packet.parse_tunnel_data().unwrap();
        assert_eq!(payload.mapping_id, "m1");
        assert_eq!(payload.data, b"payload");
        assert_eq!(bridge.stats().bytes_in, 7);
    }

    #[tokio::test]
    async fn connection_caps_reject_excess_opens() {
        let bridge = TunnelBridge::new(
            "m1",
            0,
            2,
            BridgeEnd::Local("conn_a0000000".into()),
            BridgeEnd::Local("conn_b0000000".into()),
        );
        // Creation counts as the first attach.
        bridge.try_attach().unwrap();
        assert!(matches!(
            bridge.try_attach(),
            Err(GatewayError::QuotaExceeded(_))
        ));
        bridge.detach();
        bridge.try_attach().unwrap();
    }

    #[tokio::test]
    async fn shutdown_notifies_both_local_ends_once() {
        let (conn_a, mut rx_a) = local_conn("conn_aaaa0000");
        let (conn_b, mut rx_b) = local_conn("conn_bbbb0000");
        let resolver = MapResolver(HashMap::from([
            ("conn_aaaa0000".to_string(), conn_a),
            ("conn_bbbb0000".to_string(), conn_b),
        ]));

        let bridge = TunnelBridge::new(
            "m1",
            0,
            0,
            BridgeEnd::Local("conn_aaaa0000".into()),
            BridgeEnd::Local("conn_bbbb0000".into()),
        );
        bridge.shutdown(&resolver, "mapping deleted", None).await;
        bridge.shutdown(&resolver, "again", None).await;

        let close_a = rx_a.recv().await.unwrap().parse_tunnel_close().unwrap();
        assert_eq!(close_a.reason, "mapping deleted");
        let close_b = rx_b.recv().await.unwrap().parse_tunnel_close().unwrap();
        assert_eq!(close_b.mapping_id, "m1");
        // Idempotent: no second notice queued.
        assert!(rx_a.try_recv().is_err());

        assert!(matches!(
            bridge
                .forward_from_local(&resolver, "conn_aaaa0000", vec![1])
                .await,
            Err(GatewayError::Closed)
        ));
    }

    #[tokio::test]
    async fn unknown_source_connection_is_rejected() {
        let resolver = MapResolver(HashMap::new());
        let bridge = TunnelBridge::new(
            "m1",
            0,
            0,
            BridgeEnd::Local("conn_a0000000".into()),
            BridgeEnd::Local("conn_b0000000".into()),
        );
        assert!(matches!(
            bridge
                .forward_from_local(&resolver, "conn_zzzz0000", vec![1])
                .await,
            Err(GatewayError::UnknownConnection(_))
        ));
    }

    #[tokio::test]
    async fn bridge_table_finds_bridges_by_connection() {
        let table = BridgeTable::new();
        let bridge = TunnelBridge::new(
            "m1",
            0,
            0,
            BridgeEnd::Local("conn_a0000000".into()),
            BridgeEnd::Local("conn_b0000000".into()),
        );
        table.insert(bridge);

        assert_eq!(table.find_by_connection("conn_a0000000").len(), 1);
        assert!(table.find_by_connection("conn_x0000000").is_empty());
        assert!(table.remove("m1").is_some());
        assert!(table.is_empty());
    }
}
