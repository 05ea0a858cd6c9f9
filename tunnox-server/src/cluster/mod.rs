//! # Cluster Bridge
//!
//! Forwards tunnel streams between nodes when the two agents of a mapping
//! are attached to different nodes, and carries cross-node control events
//! over the broker:
//!
//! - [`link`]       — one multiplexed TCP link to a peer node
//! - [`pool`]       — per-peer link pools with health ticks
//! - [`forward`]    — logical forward sessions on a link
//! - [`broker`]     — pub/sub fabric (in-memory backing)
//! - [`correlator`] — request/response matching over the broker

pub mod broker;
pub mod correlator;
pub mod forward;
pub mod link;
pub mod pool;

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tunnox_protocol::cluster::{
    decode_payload, encode_payload, ClusterFrame, ClusterFrameType, NodeInfoResponse,
    StreamAckPayload, StreamOpenPayload,
};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::session::fanout::FanoutService;
use crate::session::SessionManager;
use crate::state::now_millis;
use crate::stores::{NodeRegistry, PortMapping};

use broker::Broker;
use correlator::RequestCorrelator;
use forward::ForwardSession;
use link::{LinkHandler, NodeLink};
use pool::NodePool;

/// Topic every node watches for locate requests.
pub const LOCATE_TOPIC: &str = "tunnox.cluster.locate";

/// Topic a node watches for its own locate replies.
pub fn reply_topic(node_id: &str) -> String {
    format!("tunnox.cluster.reply.{node_id}")
}

/// Deadline for the remote node to ack a forward stream.
const STREAM_ACK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Debug, Serialize, Deserialize)]
struct LocateRequest {
    request_id: String,
    client_id: i64,
    reply_to: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct LocateResponse {
    request_id: String,
    client_id: i64,
    node_id: String,
}

/// The cross-node half of the gateway.
pub struct ClusterBridge {
    node_id: String,
    config: Arc<GatewayConfig>,
    broker: Arc<dyn Broker>,
    correlator: RequestCorrelator,
    pools: DashMap<String, Arc<NodePool>>,
    nodes: Arc<dyn NodeRegistry>,
    sessions: OnceLock<Arc<SessionManager>>,
    fanout: OnceLock<Arc<FanoutService>>,
    started_at: Instant,
}

impl ClusterBridge {
    pub fn new(
        config: Arc<GatewayConfig>,
        broker: Arc<dyn Broker>,
        nodes: Arc<dyn NodeRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id: config.node_id.clone(),
            config,
            broker,
            correlator: RequestCorrelator::new(),
            pools: DashMap::new(),
            nodes,
            sessions: OnceLock::new(),
            fanout: OnceLock::new(),
            started_at: Instant::now(),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn set_sessions(&self, sessions: Arc<SessionManager>) {
        let _ = self.sessions.set(sessions);
    }

    pub fn set_fanout(&self, fanout: Arc<FanoutService>) {
        let _ = self.fanout.set(fanout);
    }

    fn sessions(&self) -> Result<Arc<SessionManager>, GatewayError> {
        self.sessions
            .get()
            .cloned()
            .ok_or_else(|| GatewayError::PeerUnavailable("session layer not wired".into()))
    }

    // ── Outbound: forwarding to a peer node ──

    /// Opens a forward session to the node owning `target_client`.
    pub async fn open_remote_tunnel(
        self: &Arc<Self>,
        mapping: &PortMapping,
        target_client: i64,
        node_id: &str,
        protocol: &str,
    ) -> Result<Arc<ForwardSession>, GatewayError> {
        let address = self.nodes.get_node_address(node_id).await.ok_or_else(|| {
            GatewayError::PeerUnavailable(format!("node {node_id} has no known address"))
        })?;

        let pool = self
            .pools
            .entry(node_id.to_string())
            .or_insert_with(|| {
                NodePool::new(
                    node_id,
                    address,
                    self.config.pool.clone(),
                    Arc::clone(self) as Arc<dyn LinkHandler>,
                )
            })
            .clone();

        pool.get_or_create_session(
            StreamOpenPayload {
                mapping_id: mapping.id.clone(),
                target_client_id: target_client,
                source_node: self.node_id.clone(),
                protocol: protocol.to_string(),
            },
            STREAM_ACK_TIMEOUT,
        )
        .await
    }

    /// Asks the cluster which node owns a client's control connection.
    /// Request/response over the broker, correlated by request id.
    pub async fn locate_client(&self, client_id: i64) -> Option<String> {
        let request_id = Uuid::new_v4().to_string();
        let rx = self.correlator.register(&request_id);

        let request = LocateRequest {
            request_id: request_id.clone(),
            client_id,
            reply_to: self.node_id.clone(),
        };
        let payload = serde_json::to_vec(&request).ok()?;
        if let Err(e) = self.broker.publish(LOCATE_TOPIC, payload).await {
            warn!(client_id, error = %e, "locate publish failed");
            self.correlator.cancel(&request_id);
            return None;
        }

        match self
            .correlator
            .wait(&request_id, rx, self.config.locate_timeout())
            .await
        {
            Ok(response) => serde_json::from_slice::<LocateResponse>(&response)
                .ok()
                .map(|r| r.node_id),
            Err(_) => None,
        }
    }

    // ── Startup ──

    /// Binds the cluster listener (when configured), installs the broker
    /// subscriptions, and starts the pool health loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), GatewayError> {
        if let Err(e) = self.broker.ping().await {
            warn!(error = %e, "broker did not answer the startup ping");
        }

        if !self.config.cluster_listen.is_empty() {
            let listener = TcpListener::bind(&self.config.cluster_listen)
                .await
                .map_err(|e| {
                    GatewayError::Io(format!("bind {}: {e}", self.config.cluster_listen))
                })?;
            info!(addr = %self.config.cluster_listen, "cluster bridge listening");

            let bridge = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "peer node link accepted");
                            // The link's I/O tasks keep it alive.
                            let _ = NodeLink::accept(
                                stream,
                                Arc::clone(&bridge) as Arc<dyn LinkHandler>,
                            );
                        }
                        Err(e) => {
                            warn!(error = %e, "cluster accept failed");
                            break;
                        }
                    }
                }
            });
        }

        self.subscribe_locate().await?;
        self.subscribe_replies().await?;
        self.subscribe_push().await?;
        self.spawn_health_loop();
        Ok(())
    }

    async fn subscribe_locate(self: &Arc<Self>) -> Result<(), GatewayError> {
        let mut sub = self
            .broker
            .subscribe(LOCATE_TOPIC)
            .await
            .map_err(|e| GatewayError::PeerUnavailable(e.to_string()))?;
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = sub.recv().await {
                let Ok(request) = serde_json::from_slice::<LocateRequest>(&message.payload) else {
                    warn!("unreadable locate request");
                    continue;
                };
                // Answer only when this node actually holds the client.
                let holds = bridge
                    .sessions()
                    .ok()
                    .and_then(|s| s.control_connection(request.client_id))
                    .is_some();
                if !holds {
                    continue;
                }
                let response = LocateResponse {
                    request_id: request.request_id,
                    client_id: request.client_id,
                    node_id: bridge.node_id.clone(),
                };
                if let Ok(payload) = serde_json::to_vec(&response) {
                    let _ = bridge
                        .broker
                        .publish(&reply_topic(&request.reply_to), payload)
                        .await;
                }
            }
        });
        Ok(())
    }

    async fn subscribe_replies(self: &Arc<Self>) -> Result<(), GatewayError> {
        let mut sub = self
            .broker
            .subscribe(&reply_topic(&self.node_id))
            .await
            .map_err(|e| GatewayError::PeerUnavailable(e.to_string()))?;
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = sub.recv().await {
                if let Ok(response) = serde_json::from_slice::<LocateResponse>(&message.payload) {
                    bridge
                        .correlator
                        .resolve(&response.request_id, message.payload);
                }
            }
        });
        Ok(())
    }

    async fn subscribe_push(self: &Arc<Self>) -> Result<(), GatewayError> {
        use crate::session::fanout::{push_topic, PUSH_BROADCAST_TOPIC};

        for topic in [push_topic(&self.node_id), PUSH_BROADCAST_TOPIC.to_string()] {
            let mut sub = self
                .broker
                .subscribe(&topic)
                .await
                .map_err(|e| GatewayError::PeerUnavailable(e.to_string()))?;
            let bridge = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(message) = sub.recv().await {
                    if let Some(fanout) = bridge.fanout.get() {
                        fanout.on_push_message(&message.payload).await;
                    }
                }
            });
        }
        Ok(())
    }

    fn spawn_health_loop(self: &Arc<Self>) {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(bridge.config.pool.health_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for pool in bridge.pools.iter() {
                    let stats = pool.health_tick(&bridge.node_id).await;
                    debug!(
                        peer = %pool.peer_node_id(),
                        links = stats.links,
                        streams = stats.active_streams,
                        "pool health tick"
                    );
                }
            }
        });
    }
}

// ─── Peer-Initiated Streams ─────────────────────────────────────

#[async_trait]
impl LinkHandler for ClusterBridge {
    /// A peer node wants to reach an agent attached here: install the
    /// stream route, open the local half, and ack.
    async fn on_stream_open(&self, link: &Arc<NodeLink>, frame: ClusterFrame) {
        let stream_id = frame.stream_id;
        let open = match decode_payload::<StreamOpenPayload>(&frame.payload) {
            Ok(open) => open,
            Err(e) => {
                warn!(stream_id, error = %e, "unreadable stream open");
                return;
            }
        };
        info!(
            stream_id,
            mapping_id = %open.mapping_id,
            target_client = open.target_client_id,
            source_node = %open.source_node,
            "peer requested forward stream"
        );

        // Route first: data may follow the ack immediately.
        let rx = link.register_stream(stream_id);
        let session = ForwardSession::attach(
            stream_id,
            open.mapping_id.clone(),
            Arc::clone(link),
            rx,
        );

        let result = match self.sessions() {
            Ok(sessions) => {
                sessions
                    .open_remote_half(
                        &open.mapping_id,
                        open.target_client_id,
                        &open.protocol,
                        Arc::clone(&session),
                    )
                    .await
            }
            Err(e) => Err(e),
        };

        let ack = StreamAckPayload {
            success: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
        };
        let ack_frame = ClusterFrame::new(
            stream_id,
            ClusterFrameType::StreamAck,
            encode_payload(&ack),
        )
        .with_timestamp(now_millis());
        let _ = link.send_frame(ack_frame).await;

        if let Err(e) = result {
            warn!(stream_id, error = %e, "forward stream rejected");
            link.release_stream(stream_id);
        }
    }

    async fn node_info(&self) -> NodeInfoResponse {
        NodeInfoResponse {
            node_id: self.node_id.clone(),
            active_connections: self
                .sessions
                .get()
                .map(|s| s.connection_count() as u64)
                .unwrap_or(0),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }
}
