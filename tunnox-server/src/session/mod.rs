//! # Session Layer
//!
//! The session manager owns every agent connection on this node, drives
//! the handshake-to-ready lifecycle, and dispatches packets to command
//! handlers, tunnel bridges, or the cluster bridge when the peer agent
//! lives on another node.
//!
//! - [`connection`] — the per-link state object
//! - [`commands`]   — typed command dispatch
//! - [`fanout`]     — config-push / kick delivery

pub mod commands;
pub mod connection;
pub mod fanout;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use serde::Serialize;
use tracing::{debug, info, warn};
use tunnox_protocol::envelope::generate_connection_id;
use tunnox_protocol::packet::{
    HandshakeAck, PacketType, TransferPacket, TunnelOpenAck, TunnelOpenRequest,
};

use crate::bridge::{BridgeEnd, BridgeTable, ConnectionResolver, TunnelBridge};
use crate::cluster::forward::{ForwardEvent, ForwardSession};
use crate::cluster::ClusterBridge;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::hlp::{HlpProcessor, HlpRegistry};
use crate::stores::{AuthStore, MappingStore, NodeRegistry, PortMapping};
use crate::stream::{PacketStream, StreamError};
use commands::{CommandContext, CommandDispatcher};
use connection::{Connection, ConnectionState, TransportKind};

/// Malformed packets tolerated before the connection is closed.
const MALFORMED_STRIKE_LIMIT: u32 = 3;

/// One row of the agents listing.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub connection_id: String,
    pub client_id: i64,
    pub protocol: String,
    pub state: String,
    pub remote_addr: String,
    pub uptime_seconds: u64,
}

/// Owns connections and routes their packets.
pub struct SessionManager {
    node_id: String,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    /// client id → control connection id on this node.
    by_client: RwLock<HashMap<i64, String>>,
    bridges: BridgeTable,
    auth: Arc<dyn AuthStore>,
    mappings: Arc<dyn MappingStore>,
    nodes: Arc<dyn NodeRegistry>,
    dispatcher: CommandDispatcher,
    hlp_registry: Arc<HlpRegistry>,
    cluster: OnceLock<Arc<ClusterBridge>>,
}

impl SessionManager {
    pub fn new(
        config: Arc<GatewayConfig>,
        auth: Arc<dyn AuthStore>,
        mappings: Arc<dyn MappingStore>,
        nodes: Arc<dyn NodeRegistry>,
        hlp_registry: Arc<HlpRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id: config.node_id.clone(),
            connections: RwLock::new(HashMap::new()),
            by_client: RwLock::new(HashMap::new()),
            bridges: BridgeTable::new(),
            auth,
            mappings,
            nodes,
            dispatcher: CommandDispatcher::new(),
            hlp_registry,
            cluster: OnceLock::new(),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    /// Wires the cluster bridge in after construction (the two hold each
    /// other through `OnceLock`s).
    pub fn set_cluster(&self, cluster: Arc<ClusterBridge>) {
        let _ = self.cluster.set(cluster);
    }

    // ── Connection intake ──

    /// Registers a native-transport stream as a new connection and
    /// spawns its read loop.
    pub fn register_stream(
        self: &Arc<Self>,
        stream: Arc<dyn PacketStream>,
        protocol: TransportKind,
        remote_addr: &str,
    ) -> Arc<Connection> {
        let conn = Connection::new(generate_connection_id(), protocol, stream, remote_addr);
        self.adopt(Arc::clone(&conn));
        conn
    }

    /// Registers a freshly created HLP processor as a connection. The
    /// processor id is the connection id.
    pub fn adopt_hlp(self: &Arc<Self>, processor: Arc<HlpProcessor>) -> Arc<Connection> {
        let conn = Connection::new(
            processor.connection_id().to_string(),
            TransportKind::Hlp,
            processor,
            "hlp",
        );
        self.adopt(Arc::clone(&conn));
        conn
    }

    fn adopt(self: &Arc<Self>, conn: Arc<Connection>) {
        info!(
            connection_id = %conn.id(),
            protocol = %conn.protocol(),
            remote_addr = %conn.remote_addr(),
            "new connection"
        );
        self.connections
            .write()
            .expect("connections lock poisoned")
            .insert(conn.id().to_string(), Arc::clone(&conn));

        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.read_loop(conn).await });
    }

    async fn read_loop(self: Arc<Self>, conn: Arc<Connection>) {
        loop {
            match conn.stream().read_packet().await {
                Ok(packet) => {
                    conn.touch();
                    self.handle_packet(&conn, packet).await;
                    if conn.is_closed() {
                        break;
                    }
                }
                Err(StreamError::Closed) => break,
                Err(StreamError::Codec(err)) => {
                    if self.note_malformed(&conn, &err.to_string()).await {
                        break;
                    }
                }
                Err(StreamError::Io(err)) => {
                    warn!(connection_id = %conn.id(), error = %err, "stream i/o error");
                    break;
                }
            }
        }
        self.cleanup_connection(&conn).await;
    }

    /// Records one malformed packet; closes the connection on the third
    /// and reports whether it did.
    pub async fn note_malformed(&self, conn: &Arc<Connection>, detail: &str) -> bool {
        let strikes = conn.strike();
        warn!(
            connection_id = %conn.id(),
            strikes,
            detail,
            "malformed packet"
        );
        if strikes >= MALFORMED_STRIKE_LIMIT {
            self.close_connection(conn, "too many malformed packets").await;
            return true;
        }
        false
    }

    // ── Packet dispatch ──

    pub async fn handle_packet(self: &Arc<Self>, conn: &Arc<Connection>, packet: TransferPacket) {
        match packet.packet_type {
            PacketType::Handshake => self.handle_handshake(conn, &packet).await,
            PacketType::JsonCommand => self.handle_command(conn, &packet).await,
            PacketType::TunnelOpen => self.handle_tunnel_open(conn, &packet).await,
            PacketType::TunnelOpenAck => self.handle_tunnel_open_ack(conn, &packet).await,
            PacketType::TunnelData => self.handle_tunnel_data(conn, packet).await,
            PacketType::TunnelClose => self.handle_tunnel_close(conn, &packet).await,
            PacketType::Heartbeat => self.handle_heartbeat(conn).await,
            PacketType::HandshakeResponse => {
                // Server-bound streams never carry one.
                self.note_malformed(conn, "unexpected handshake response").await;
            }
        }
    }

    async fn handle_handshake(&self, conn: &Arc<Connection>, packet: &TransferPacket) {
        let Some(request) = packet.parse_handshake() else {
            self.note_malformed(conn, "unreadable handshake").await;
            return;
        };
        conn.set_state(ConnectionState::HandshakeInProgress);

        match self.auth.validate_credentials(&request).await {
            Ok(client_id) => {
                conn.set_client_id(client_id);

                // One control connection per client per node: a newer
                // handshake supersedes and closes the older link.
                let superseded = {
                    let mut by_client =
                        self.by_client.write().expect("by_client lock poisoned");
                    by_client
                        .insert(client_id, conn.id().to_string())
                        .filter(|old| old != conn.id())
                };
                if let Some(old_id) = superseded {
                    let old = self.resolve(&old_id);
                    if let Some(old) = old {
                        info!(
                            client_id,
                            old_connection = %old_id,
                            new_connection = %conn.id(),
                            "control connection superseded"
                        );
                        self.close_connection(&old, "superseded by newer connection").await;
                    }
                }
                if conn.protocol() == TransportKind::Hlp {
                    self.hlp_registry.bind_client(conn.id(), client_id);
                }
                self.nodes.set_client_owner(client_id, &self.node_id).await;

                conn.set_state(ConnectionState::Authenticated);
                info!(connection_id = %conn.id(), client_id, "handshake complete");

                let ack = TransferPacket::handshake_response(&HandshakeAck {
                    success: true,
                    connection_id: conn.id().to_string(),
                    client_id,
                    error: None,
                });
                if let Err(e) = conn.send(ack).await {
                    warn!(connection_id = %conn.id(), error = %e, "handshake ack lost");
                }
            }
            Err(err) => {
                warn!(connection_id = %conn.id(), error = %err, "handshake rejected");
                let ack = TransferPacket::handshake_response(&HandshakeAck {
                    success: false,
                    connection_id: conn.id().to_string(),
                    client_id: 0,
                    error: Some(err.to_string()),
                });
                let _ = conn.send(ack).await;
                self.close_connection(conn, "handshake failed").await;
            }
        }
    }

    async fn handle_command(&self, conn: &Arc<Connection>, packet: &TransferPacket) {
        let Some(command) = packet.command.clone() else {
            self.note_malformed(conn, "json command without envelope").await;
            return;
        };
        let ctx = CommandContext {
            connection_id: conn.id().to_string(),
            client_id: conn.client_id(),
        };
        let response = self.dispatcher.dispatch(&ctx, &command).await;
        if let Err(e) = conn.send(TransferPacket::json_command(response)).await {
            warn!(
                connection_id = %conn.id(),
                command_id = %command.command_id,
                error = %e,
                "command response lost"
            );
        }
    }

    async fn handle_tunnel_open(self: &Arc<Self>, conn: &Arc<Connection>, packet: &TransferPacket) {
        let Some(request) = packet.parse_tunnel_open() else {
            self.note_malformed(conn, "unreadable tunnel open").await;
            return;
        };

        let result = self.open_tunnel(conn, &request).await;
        let ack = TransferPacket::tunnel_open_ack(&TunnelOpenAck {
            mapping_id: request.mapping_id.clone(),
            success: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        if result.is_ok() {
            conn.set_state(ConnectionState::TunnelOpen);
        }
        if let Err(e) = conn.send(ack).await {
            warn!(connection_id = %conn.id(), error = %e, "tunnel open ack lost");
        }
    }

    async fn open_tunnel(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        request: &TunnelOpenRequest,
    ) -> Result<(), GatewayError> {
        if conn.client_id() == 0 {
            return Err(GatewayError::Unauthorized("handshake required".into()));
        }
        let mapping = self
            .mappings
            .get_port_mapping(&request.mapping_id)
            .await
            .ok_or_else(|| {
                GatewayError::NotAuthorized(format!("unknown mapping {}", request.mapping_id))
            })?;
        if !mapping.enabled {
            return Err(GatewayError::NotAuthorized(format!(
                "mapping {} is disabled",
                mapping.id
            )));
        }
        let peer_client = mapping.peer_of(conn.client_id()).ok_or_else(|| {
            GatewayError::NotAuthorized(format!(
                "client {} does not own mapping {}",
                conn.client_id(),
                mapping.id
            ))
        })?;

        // Attach to an already-open bridge when one exists.
        if let Some(bridge) = self.bridges.get(&mapping.id) {
            if !bridge.is_closed() {
                return bridge.try_attach();
            }
            self.bridges.remove(&mapping.id);
        }

        if let Some(peer_conn) = self.control_connection(peer_client) {
            self.open_local_bridge(&mapping, conn, &peer_conn, request).await
        } else {
            self.open_remote_bridge(&mapping, conn, peer_client, request).await
        }
    }

    async fn open_local_bridge(
        &self,
        mapping: &PortMapping,
        conn: &Arc<Connection>,
        peer_conn: &Arc<Connection>,
        request: &TunnelOpenRequest,
    ) -> Result<(), GatewayError> {
        let bridge = TunnelBridge::new(
            &mapping.id,
            mapping.bandwidth_bps,
            mapping.max_conns,
            BridgeEnd::Local(conn.id().to_string()),
            BridgeEnd::Local(peer_conn.id().to_string()),
        );
        self.bridges.insert(Arc::clone(&bridge));

        // Ask the peer agent to dial its destination.
        let notify = TransferPacket::tunnel_open(&TunnelOpenRequest {
            mapping_id: mapping.id.clone(),
            protocol: request.protocol.clone(),
        });
        if let Err(e) = peer_conn.send(notify).await {
            self.bridges.remove(&mapping.id);
            return Err(GatewayError::PeerUnavailable(format!(
                "peer connection lost: {e}"
            )));
        }
        info!(
            mapping_id = %mapping.id,
            source = %conn.id(),
            target = %peer_conn.id(),
            "local tunnel bridge opened"
        );
        Ok(())
    }

    async fn open_remote_bridge(
        self: &Arc<Self>,
        mapping: &PortMapping,
        conn: &Arc<Connection>,
        peer_client: i64,
        request: &TunnelOpenRequest,
    ) -> Result<(), GatewayError> {
        let cluster = self
            .cluster
            .get()
            .ok_or_else(|| GatewayError::PeerUnavailable("peer is offline".into()))?;

        // Fast path: the ownership caches. Fall back to a broker locate.
        let mut owner = match self.mappings.get_client_node_id(peer_client).await {
            Some(node) => Some(node),
            None => self.nodes.client_owner(peer_client).await,
        };
        if owner.as_deref() == Some(self.node_id.as_str()) {
            // The cache says "here" but no control connection exists.
            return Err(GatewayError::PeerUnavailable("peer is offline".into()));
        }
        if owner.is_none() {
            owner = cluster.locate_client(peer_client).await;
        }
        let owner = owner
            .ok_or_else(|| GatewayError::PeerUnavailable("peer is offline".into()))?;

        let session = cluster
            .open_remote_tunnel(mapping, peer_client, &owner, &request.protocol)
            .await?;
        self.attach_remote_bridge(mapping, conn.id().to_string(), session);
        info!(
            mapping_id = %mapping.id,
            source = %conn.id(),
            owner_node = %owner,
            "cross-node tunnel bridge opened"
        );
        Ok(())
    }

    /// Installs a bridge whose far half is a cluster forward session and
    /// pumps incoming session events until it ends.
    pub fn attach_remote_bridge(
        self: &Arc<Self>,
        mapping: &PortMapping,
        local_connection_id: String,
        session: Arc<ForwardSession>,
    ) -> Arc<TunnelBridge> {
        let bridge = TunnelBridge::new(
            &mapping.id,
            mapping.bandwidth_bps,
            mapping.max_conns,
            BridgeEnd::Local(local_connection_id),
            BridgeEnd::Remote(Arc::clone(&session) as Arc<dyn crate::bridge::RemoteEndpoint>),
        );
        self.bridges.insert(Arc::clone(&bridge));
        self.spawn_remote_pump(Arc::clone(&bridge), session);
        bridge
    }

    fn spawn_remote_pump(self: &Arc<Self>, bridge: Arc<TunnelBridge>, session: Arc<ForwardSession>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match session.recv().await {
                    ForwardEvent::Data(data) => {
                        if let Err(e) = bridge.forward_from_remote(&*manager, data).await {
                            warn!(
                                mapping_id = %bridge.mapping_id(),
                                error = %e,
                                "remote forward failed"
                            );
                            break;
                        }
                    }
                    ForwardEvent::Closed(reason) => {
                        debug!(mapping_id = %bridge.mapping_id(), reason, "forward session closed");
                        break;
                    }
                    ForwardEvent::Aborted => {
                        warn!(mapping_id = %bridge.mapping_id(), "forward session aborted");
                        break;
                    }
                }
            }
            manager.bridges.remove(bridge.mapping_id());
            bridge.shutdown(&*manager, "forward session ended", None).await;
        });
    }

    async fn handle_tunnel_open_ack(&self, conn: &Arc<Connection>, packet: &TransferPacket) {
        let Some(ack) = packet.parse_tunnel_open_ack() else {
            self.note_malformed(conn, "unreadable tunnel open ack").await;
            return;
        };
        if ack.success {
            debug!(mapping_id = %ack.mapping_id, connection_id = %conn.id(), "tunnel open acked");
            return;
        }
        warn!(
            mapping_id = %ack.mapping_id,
            connection_id = %conn.id(),
            error = ack.error.as_deref().unwrap_or("unknown"),
            "agent rejected tunnel open"
        );
        if let Some(bridge) = self.bridges.remove(&ack.mapping_id) {
            bridge
                .shutdown(self, "agent rejected tunnel open", Some(conn.id()))
                .await;
        }
    }

    async fn handle_tunnel_data(&self, conn: &Arc<Connection>, packet: TransferPacket) {
        let Some(payload) = packet.parse_tunnel_data() else {
            self.note_malformed(conn, "unreadable tunnel data").await;
            return;
        };

        if payload.mapping_id.is_empty() {
            // Unbound data channel: echo back. Agents use this to verify
            // connectivity before the handshake claims the connection.
            if let Err(e) = conn.send(packet).await {
                warn!(connection_id = %conn.id(), error = %e, "echo failed");
            }
            return;
        }

        let Some(bridge) = self.bridges.get(&payload.mapping_id) else {
            warn!(
                connection_id = %conn.id(),
                mapping_id = %payload.mapping_id,
                "tunnel data for a mapping with no bridge"
            );
            return;
        };
        // The bridge resolves the peer and sends without any lock held.
        if let Err(e) = bridge
            .forward_from_local(self, conn.id(), payload.data)
            .await
        {
            warn!(
                connection_id = %conn.id(),
                mapping_id = %payload.mapping_id,
                error = %e,
                "tunnel forward failed"
            );
            self.bridges.remove(&payload.mapping_id);
            bridge.shutdown(self, "forward failed", None).await;
        }
    }

    async fn handle_tunnel_close(&self, conn: &Arc<Connection>, packet: &TransferPacket) {
        let Some(notice) = packet.parse_tunnel_close() else {
            self.note_malformed(conn, "unreadable tunnel close").await;
            return;
        };
        if let Some(bridge) = self.bridges.remove(&notice.mapping_id) {
            bridge
                .shutdown(self, "closed by peer", Some(conn.id()))
                .await;
        }
    }

    async fn handle_heartbeat(&self, conn: &Arc<Connection>) {
        conn.touch();
        if let Err(e) = conn.send(TransferPacket::heartbeat()).await {
            debug!(connection_id = %conn.id(), error = %e, "heartbeat reply lost");
        }
    }

    // ── Lookups ──

    /// O(1): the single control connection a client holds on this node.
    pub fn control_connection(&self, client_id: i64) -> Option<Arc<Connection>> {
        let id = self
            .by_client
            .read()
            .expect("by_client lock poisoned")
            .get(&client_id)
            .cloned()?;
        self.resolve(&id)
    }

    pub fn connection_by_id(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.resolve(connection_id)
    }

    pub fn bridge_by_mapping(&self, mapping_id: &str) -> Option<Arc<TunnelBridge>> {
        self.bridges.get(mapping_id)
    }

    pub fn bridge_by_connection(&self, connection_id: &str) -> Option<Arc<TunnelBridge>> {
        self.bridges.find_by_connection(connection_id).into_iter().next()
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .expect("connections lock poisoned")
            .len()
    }

    pub fn agents(&self) -> Vec<AgentInfo> {
        self.connections
            .read()
            .expect("connections lock poisoned")
            .values()
            .map(|conn| AgentInfo {
                connection_id: conn.id().to_string(),
                client_id: conn.client_id(),
                protocol: conn.protocol().to_string(),
                state: conn.state().to_string(),
                remote_addr: conn.remote_addr().to_string(),
                uptime_seconds: conn.uptime().as_secs(),
            })
            .collect()
    }

    // ── Remote halves (driven by the cluster bridge) ──

    /// Opens the local half of a cross-node tunnel: the target client's
    /// control connection lives here, the opener on the peer node.
    pub async fn open_remote_half(
        self: &Arc<Self>,
        mapping_id: &str,
        target_client: i64,
        protocol: &str,
        session: Arc<ForwardSession>,
    ) -> Result<(), GatewayError> {
        let mapping = self
            .mappings
            .get_port_mapping(mapping_id)
            .await
            .ok_or_else(|| {
                GatewayError::NotAuthorized(format!("unknown mapping {mapping_id}"))
            })?;
        let target_conn = self.control_connection(target_client).ok_or_else(|| {
            GatewayError::PeerUnavailable(format!("client {target_client} is not attached here"))
        })?;

        // Ask the local agent to dial its destination before installing
        // the bridge; early data buffers on the stream route meanwhile.
        let notify = TransferPacket::tunnel_open(&TunnelOpenRequest {
            mapping_id: mapping.id.clone(),
            protocol: protocol.to_string(),
        });
        target_conn
            .send(notify)
            .await
            .map_err(|e| GatewayError::PeerUnavailable(format!("target agent lost: {e}")))?;

        self.attach_remote_bridge(&mapping, target_conn.id().to_string(), session);
        Ok(())
    }

    // ── Teardown ──

    pub async fn close_connection(&self, conn: &Arc<Connection>, reason: &str) {
        if conn.state() == ConnectionState::Closed {
            return;
        }
        info!(connection_id = %conn.id(), reason, "closing connection");
        conn.set_state(ConnectionState::Closing);
        conn.close().await;
        // The read loop observes the closed stream and finishes cleanup;
        // for connections without a live loop, clean up here as well.
        self.cleanup_connection(conn).await;
    }

    async fn cleanup_connection(&self, conn: &Arc<Connection>) {
        let removed = self
            .connections
            .write()
            .expect("connections lock poisoned")
            .remove(conn.id())
            .is_some();
        if !removed {
            return;
        }
        conn.set_state(ConnectionState::Closed);

        let client_id = conn.client_id();
        let still_owner = {
            let mut by_client = self.by_client.write().expect("by_client lock poisoned");
            match by_client.get(&client_id) {
                Some(id) if id == conn.id() => {
                    by_client.remove(&client_id);
                    true
                }
                _ => false,
            }
        };
        if conn.protocol() == TransportKind::Hlp {
            self.hlp_registry.remove(conn.id());
        }
        if client_id != 0 && still_owner {
            self.nodes.clear_client_owner(client_id, &self.node_id).await;
        }

        for bridge in self.bridges.find_by_connection(conn.id()) {
            self.bridges.remove(bridge.mapping_id());
            bridge
                .shutdown(self, "connection closed", Some(conn.id()))
                .await;
        }
        conn.close().await;
        info!(connection_id = %conn.id(), client_id, "connection removed");
    }
}

impl ConnectionResolver for SessionManager {
    fn resolve(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .expect("connections lock poisoned")
            .get(connection_id)
            .cloned()
    }
}
