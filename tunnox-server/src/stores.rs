//! # Collaborator Stores
//!
//! The core consumes authorization, mapping and node-location data through
//! the narrow traits below. Production deployments back them with the
//! management plane; the in-memory implementations here serve single-node
//! runs and tests. Nothing above these traits knows which backing is in
//! use.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tunnox_protocol::packet::HandshakeRequest;

use crate::error::GatewayError;

// ─── Records ────────────────────────────────────────────────────

/// A registered agent identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub auth_token: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// The authorization + config record pairing two agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    pub id: String,
    /// Agent exposing the listening socket.
    pub listen_client_id: i64,
    /// Agent dialing the destination.
    pub target_client_id: i64,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub target_host: String,
    #[serde(default)]
    pub target_port: u16,
    #[serde(default)]
    pub source_port: u16,
    /// 0 means unlimited.
    #[serde(default)]
    pub bandwidth_bps: u64,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_conns: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

impl PortMapping {
    /// The other agent of the pair, from one agent's point of view.
    pub fn peer_of(&self, client_id: i64) -> Option<i64> {
        if client_id == self.listen_client_id {
            Some(self.target_client_id)
        } else if client_id == self.target_client_id {
            Some(self.listen_client_id)
        } else {
            None
        }
    }
}

/// One node of the server cluster as seen by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub node_id: String,
    /// Cluster-bridge listen address, host:port.
    pub address: String,
}

// ─── Traits ─────────────────────────────────────────────────────

/// Credential validation for handshakes and tokens.
#[async_trait]
pub trait AuthStore: Send + Sync {
    /// Validates a handshake, returning the authenticated client id.
    async fn validate_credentials(&self, handshake: &HandshakeRequest)
        -> Result<i64, GatewayError>;

    /// Validates a bare token, returning the owning client.
    async fn validate_token(&self, token: &str) -> Result<Client, GatewayError>;
}

/// Read access to the authoritative mapping store.
#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn get_port_mapping(&self, id: &str) -> Option<PortMapping>;

    /// Which node currently owns the client's control connection, if the
    /// store tracks it.
    async fn get_client_node_id(&self, client_id: i64) -> Option<String>;
}

/// Cluster membership and client-ownership cache.
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    async fn get_node_address(&self, node_id: &str) -> Option<String>;

    async fn list_all_nodes(&self) -> Vec<NodeEntry>;

    /// Cached owner of a client's control connection; `None` when offline
    /// or unknown.
    async fn client_owner(&self, client_id: i64) -> Option<String>;

    /// Records this node as a client's owner (on handshake success).
    async fn set_client_owner(&self, client_id: i64, node_id: &str);

    /// Drops the ownership record (on disconnect).
    async fn clear_client_owner(&self, client_id: i64, node_id: &str);
}

// ─── In-Memory Implementations ──────────────────────────────────

/// Token-table auth store for tests and single-node runs.
#[derive(Default)]
pub struct MemoryAuthStore {
    clients: DashMap<i64, Client>,
}

impl MemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, client: Client) {
        self.clients.insert(client.id, client);
    }
}

#[async_trait]
impl AuthStore for MemoryAuthStore {
    async fn validate_credentials(
        &self,
        handshake: &HandshakeRequest,
    ) -> Result<i64, GatewayError> {
        let client = self
            .clients
            .get(&handshake.client_id)
            .ok_or_else(|| GatewayError::Unauthorized("unknown client".into()))?;
        if !client.enabled {
            return Err(GatewayError::Unauthorized("client disabled".into()));
        }
        if client.auth_token != handshake.auth_token {
            return Err(GatewayError::Unauthorized("bad token".into()));
        }
        Ok(client.id)
    }

    async fn validate_token(&self, token: &str) -> Result<Client, GatewayError> {
        self.clients
            .iter()
            .find(|c| c.auth_token == token && c.enabled)
            .map(|c| c.value().clone())
            .ok_or_else(|| GatewayError::Unauthorized("bad token".into()))
    }
}

/// Mapping table for tests and single-node runs.
#[derive(Default)]
pub struct MemoryMappingStore {
    mappings: DashMap<String, PortMapping>,
    client_nodes: DashMap<i64, String>,
}

impl MemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, mapping: PortMapping) {
        self.mappings.insert(mapping.id.clone(), mapping);
    }

    pub fn remove(&self, id: &str) -> Option<PortMapping> {
        self.mappings.remove(id).map(|(_, m)| m)
    }

    pub fn set_client_node(&self, client_id: i64, node_id: &str) {
        self.client_nodes.insert(client_id, node_id.to_string());
    }
}

#[async_trait]
impl MappingStore for MemoryMappingStore {
    async fn get_port_mapping(&self, id: &str) -> Option<PortMapping> {
        self.mappings.get(id).map(|m| m.value().clone())
    }

    async fn get_client_node_id(&self, client_id: i64) -> Option<String> {
        self.client_nodes.get(&client_id).map(|n| n.value().clone())
    }
}

/// Node membership table for tests and single-node runs.
///
/// In a clustered deployment every node shares one logical registry (the
/// management plane); sharing one `MemoryNodeRegistry` between in-process
/// nodes models that in tests.
#[derive(Default)]
pub struct MemoryNodeRegistry {
    nodes: DashMap<String, NodeEntry>,
    owners: DashMap<i64, String>,
}

impl MemoryNodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_node(&self, entry: NodeEntry) {
        self.nodes.insert(entry.node_id.clone(), entry);
    }

    pub fn remove_node(&self, node_id: &str) {
        self.nodes.remove(node_id);
    }
}

#[async_trait]
impl NodeRegistry for MemoryNodeRegistry {
    async fn get_node_address(&self, node_id: &str) -> Option<String> {
        self.nodes.get(node_id).map(|n| n.address.clone())
    }

    async fn list_all_nodes(&self) -> Vec<NodeEntry> {
        self.nodes.iter().map(|n| n.value().clone()).collect()
    }

    async fn client_owner(&self, client_id: i64) -> Option<String> {
        self.owners.get(&client_id).map(|n| n.value().clone())
    }

    async fn set_client_owner(&self, client_id: i64, node_id: &str) {
        self.owners.insert(client_id, node_id.to_string());
    }

    async fn clear_client_owner(&self, client_id: i64, node_id: &str) {
        // Only the current owner may clear, so a reconnect that already
        // moved the client elsewhere is not wiped out by a late cleanup.
        self.owners
            .remove_if(&client_id, |_, owner| owner == node_id);
    }
}
