//! # Gateway State
//!
//! Builds and holds the shared state an axum handler needs: the HLP
//! registry, the session manager, the cluster bridge, and the fan-out
//! service, all wired over the collaborator stores. Cloned into every
//! request handler, the teacher pattern for axum applications.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::cluster::broker::{Broker, MemoryBroker};
use crate::cluster::ClusterBridge;
use crate::config::GatewayConfig;
use crate::hlp::HlpRegistry;
use crate::session::fanout::FanoutService;
use crate::session::SessionManager;
use crate::stores::{
    AuthStore, MappingStore, MemoryAuthStore, MemoryMappingStore, MemoryNodeRegistry,
    NodeRegistry,
};
use crate::stream::PacketStream;
use crate::{api, hlp, transport};

/// Unix milliseconds, the timestamp unit of every wire response.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Shared application state, cloned into each request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<HlpRegistry>,
    pub sessions: Arc<SessionManager>,
    pub cluster: Arc<ClusterBridge>,
    pub fanout: Arc<FanoutService>,
}

impl AppState {
    /// Builds a node from its config, seeding the in-memory stores with
    /// the config's static clients/mappings/peers.
    pub fn build(config: GatewayConfig) -> Self {
        let auth = MemoryAuthStore::new();
        for client in &config.clients {
            auth.insert(client.clone());
        }
        let mappings = MemoryMappingStore::new();
        for mapping in &config.mappings {
            mappings.insert(mapping.clone());
        }
        let nodes = MemoryNodeRegistry::new();
        for peer in &config.peers {
            nodes.insert_node(peer.clone());
        }

        Self::build_with_stores(
            Arc::new(config),
            Arc::new(auth),
            Arc::new(mappings),
            Arc::new(nodes),
            Arc::new(MemoryBroker::new()),
        )
    }

    /// Wires the full component graph over explicit collaborators.
    /// Cluster tests share one registry and broker across several nodes.
    pub fn build_with_stores(
        config: Arc<GatewayConfig>,
        auth: Arc<dyn AuthStore>,
        mappings: Arc<dyn MappingStore>,
        nodes: Arc<dyn NodeRegistry>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        let registry = Arc::new(HlpRegistry::new());
        let sessions = SessionManager::new(
            Arc::clone(&config),
            auth,
            mappings,
            Arc::clone(&nodes),
            Arc::clone(&registry),
        );
        let cluster = ClusterBridge::new(Arc::clone(&config), Arc::clone(&broker), nodes.clone());
        let fanout = FanoutService::new(
            Arc::clone(&config),
            Arc::clone(&sessions),
            nodes,
            broker,
        );

        sessions.set_cluster(Arc::clone(&cluster));
        cluster.set_sessions(Arc::clone(&sessions));
        cluster.set_fanout(Arc::clone(&fanout));

        Self {
            config,
            registry,
            sessions,
            cluster,
            fanout,
        }
    }

    /// The HTTP surface: HLP push/poll, the WebSocket transport, and the
    /// agents listing.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/tunnox/v1/push", post(hlp::handlers::push))
            .route("/tunnox/v1/poll", get(hlp::handlers::poll))
            .route("/tunnox/v1/ws", get(transport::ws::ws_handler))
            .route("/tunnox/v1/agents", get(api::list_agents))
            .layer(CorsLayer::permissive())
            .with_state(self.clone())
    }

    /// Starts the fragment-TTL and idle-connection sweeps. One task
    /// serves the whole process.
    pub fn spawn_maintenance(&self) {
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let group_ttl = state.config.fragment_group_ttl();
                let idle_ttl = state.config.idle_connection_ttl();

                for processor in state.registry.snapshot() {
                    for group_id in processor.sweep_fragments(group_ttl) {
                        warn!(
                            connection_id = %processor.connection_id(),
                            group_id = %group_id,
                            "fragment group expired"
                        );
                    }
                    if processor.idle_for() > idle_ttl && !processor.is_closed() {
                        info!(
                            connection_id = %processor.connection_id(),
                            "reaping idle HLP connection"
                        );
                        // The session read loop observes the close and
                        // finishes the cleanup.
                        processor.close().await;
                    }
                }
            }
        });
    }
}
