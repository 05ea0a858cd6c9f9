//! # Node Connection Pools
//!
//! One pool per peer node keeps `[min_conns, max_conns]` long-lived links
//! and places each new forward session on the least-loaded link with
//! stream capacity, dialing a fresh link when none qualifies and failing
//! with *PoolExhausted* at the cap. A periodic health tick pings every
//! link, drops the broken ones, and redials back up to the floor.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tunnox_protocol::cluster::StreamOpenPayload;

use crate::config::PoolSettings;
use crate::error::GatewayError;

use super::forward::ForwardSession;
use super::link::{LinkHandler, NodeLink};

/// Stats snapshot refreshed by the health tick.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub links: usize,
    pub broken: usize,
    pub active_streams: usize,
}

pub struct NodePool {
    peer_node_id: String,
    peer_addr: String,
    settings: PoolSettings,
    links: RwLock<Vec<Arc<NodeLink>>>,
    /// Serializes dials so a burst of sessions cannot overshoot
    /// `max_conns`.
    dial_lock: Mutex<()>,
    handler: Arc<dyn LinkHandler>,
}

impl NodePool {
    pub fn new(
        peer_node_id: impl Into<String>,
        peer_addr: impl Into<String>,
        settings: PoolSettings,
        handler: Arc<dyn LinkHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer_node_id: peer_node_id.into(),
            peer_addr: peer_addr.into(),
            settings,
            links: RwLock::new(Vec::new()),
            dial_lock: Mutex::new(()),
            handler,
        })
    }

    pub fn peer_node_id(&self) -> &str {
        &self.peer_node_id
    }

    /// Opens a forward session on the best available link.
    pub async fn get_or_create_session(
        &self,
        open: StreamOpenPayload,
        ack_timeout: Duration,
    ) -> Result<Arc<ForwardSession>, GatewayError> {
        let link = self.pick_or_dial().await?;
        ForwardSession::open(&link, open, ack_timeout).await
    }

    async fn pick_or_dial(&self) -> Result<Arc<NodeLink>, GatewayError> {
        if let Some(link) = self.least_loaded() {
            return Ok(link);
        }

        let _guard = self.dial_lock.lock().await;
        // A concurrent dialer may have added capacity while we waited.
        if let Some(link) = self.least_loaded() {
            return Ok(link);
        }

        let live = self.prune_broken();
        if live >= self.settings.max_conns {
            return Err(GatewayError::PoolExhausted(format!(
                "all {} links to {} are at {} streams",
                live, self.peer_node_id, self.settings.max_streams_per_conn
            )));
        }

        debug!(peer = %self.peer_node_id, "dialing additional pool link");
        let link = NodeLink::connect(
            &self.peer_addr,
            self.settings.dial_timeout(),
            Arc::clone(&self.handler),
        )
        .await?;
        self.links
            .write()
            .expect("pool links poisoned")
            .push(Arc::clone(&link));
        Ok(link)
    }

    /// Healthy link with free stream capacity carrying the least load.
    fn least_loaded(&self) -> Option<Arc<NodeLink>> {
        self.links
            .read()
            .expect("pool links poisoned")
            .iter()
            .filter(|l| !l.is_broken() && l.active_streams() < self.settings.max_streams_per_conn)
            .min_by_key(|l| l.active_streams())
            .cloned()
    }

    /// Drops broken links; returns the live count.
    fn prune_broken(&self) -> usize {
        let mut links = self.links.write().expect("pool links poisoned");
        links.retain(|l| !l.is_broken());
        links.len()
    }

    /// Pings every link, prunes the dead, and redials up to `min_conns`.
    pub async fn health_tick(&self, self_node_id: &str) -> PoolStats {
        let snapshot: Vec<Arc<NodeLink>> = self
            .links
            .read()
            .expect("pool links poisoned")
            .iter()
            .cloned()
            .collect();

        for link in &snapshot {
            if link.is_broken() {
                continue;
            }
            if let Err(e) = link.ping(self_node_id).await {
                warn!(
                    peer = %self.peer_node_id,
                    addr = %link.peer_addr(),
                    error = %e,
                    "pool link failed its health ping"
                );
                link.mark_broken();
            }
        }

        let mut live = self.prune_broken();
        while live < self.settings.min_conns {
            match NodeLink::connect(
                &self.peer_addr,
                self.settings.dial_timeout(),
                Arc::clone(&self.handler),
            )
            .await
            {
                Ok(link) => {
                    info!(peer = %self.peer_node_id, "pool link redialed");
                    self.links.write().expect("pool links poisoned").push(link);
                    live += 1;
                }
                Err(e) => {
                    warn!(peer = %self.peer_node_id, error = %e, "pool redial failed");
                    break;
                }
            }
        }

        self.stats()
    }

    pub fn stats(&self) -> PoolStats {
        let links = self.links.read().expect("pool links poisoned");
        PoolStats {
            links: links.len(),
            broken: links.iter().filter(|l| l.is_broken()).count(),
            active_streams: links.iter().map(|l| l.active_streams()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::net::TcpListener;
    use tunnox_protocol::cluster::{ClusterFrame, NodeInfoResponse};

    struct NullHandler;

    #[async_trait]
    impl LinkHandler for NullHandler {
        async fn on_stream_open(&self, _link: &Arc<NodeLink>, _frame: ClusterFrame) {}

        async fn node_info(&self) -> NodeInfoResponse {
            NodeInfoResponse {
                node_id: "null".into(),
                active_connections: 0,
                uptime_seconds: 0,
            }
        }
    }

    async fn peer_listener() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let _ = NodeLink::accept(stream, Arc::new(NullHandler));
            }
        });
        addr
    }

    fn settings(min: usize, max: usize) -> PoolSettings {
        PoolSettings {
            min_conns: min,
            max_conns: max,
            max_streams_per_conn: 4,
            dial_timeout_ms: 1_000,
            health_interval_secs: 30,
        }
    }

    #[tokio::test]
    async fn the_health_tick_fills_the_pool_to_its_floor() {
        let addr = peer_listener().await;
        let pool = NodePool::new("peer", addr, settings(2, 4), Arc::new(NullHandler));
        assert_eq!(pool.stats().links, 0);

        let stats = pool.health_tick("node-test").await;
        assert_eq!(stats.links, 2);
        assert_eq!(stats.broken, 0);

        // A second tick pings the live links and keeps the floor.
        let stats = pool.health_tick("node-test").await;
        assert_eq!(stats.links, 2);
    }

    #[tokio::test]
    async fn broken_links_are_pruned_and_redialed() {
        let addr = peer_listener().await;
        let pool = NodePool::new("peer", addr, settings(1, 4), Arc::new(NullHandler));
        pool.health_tick("node-test").await;

        let link = pool.least_loaded().unwrap();
        link.mark_broken();
        assert_eq!(pool.stats().broken, 1);

        let stats = pool.health_tick("node-test").await;
        assert_eq!(stats.links, 1);
        assert_eq!(stats.broken, 0);
    }

    #[tokio::test]
    async fn an_unreachable_peer_is_a_peer_unavailable_error() {
        // A port with nothing listening on it.
        let unbound = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = probe.local_addr().unwrap().to_string();
            drop(probe);
            addr
        };
        let pool = NodePool::new("peer", unbound, settings(1, 1), Arc::new(NullHandler));
        let result = pool
            .get_or_create_session(
                tunnox_protocol::cluster::StreamOpenPayload {
                    mapping_id: "m1".into(),
                    target_client_id: 1,
                    source_node: "node-test".into(),
                    protocol: "tcp".into(),
                },
                Duration::from_secs(1),
            )
            .await;
        assert!(matches!(result, Err(GatewayError::PeerUnavailable(_))));
    }
}
