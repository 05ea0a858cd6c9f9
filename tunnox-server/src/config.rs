//! # Gateway Configuration
//!
//! All tunables in one place, with defaults that boot a single-node
//! gateway out of the box. An optional JSON config file (first CLI
//! argument) overrides the defaults; listen addresses can additionally be
//! overridden with `TUNNOX_*` environment variables, mirroring the
//! `RUST_LOG`-style env-driven boot.

use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use crate::stores::{Client, NodeEntry, PortMapping};

/// Cross-node pool limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Links kept alive to each peer node.
    pub min_conns: usize,
    /// Hard cap on links per peer node.
    pub max_conns: usize,
    /// Logical streams multiplexed on one link.
    pub max_streams_per_conn: usize,
    pub dial_timeout_ms: u64,
    pub health_interval_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_conns: 1,
            max_conns: 4,
            max_streams_per_conn: 64,
            dial_timeout_ms: 5_000,
            health_interval_secs: 30,
        }
    }
}

impl PoolSettings {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Unique id of this node in the cluster.
    pub node_id: String,

    /// HLP + WebSocket + REST listener.
    pub http_listen: String,
    /// Native TCP transport listener; empty disables it.
    pub tcp_listen: String,
    /// QUIC transport listener; empty disables it.
    pub quic_listen: String,
    /// Node-to-node cluster listener; empty disables it.
    pub cluster_listen: String,

    /// Outbound fragment size after base64 framing.
    pub fragment_size: usize,
    /// Fragments buffered per tunnel type per connection.
    pub write_queue_capacity: usize,
    /// Inbound fragment-table byte budget per connection.
    pub inbound_byte_budget: usize,

    pub poll_default_timeout_secs: u64,
    pub poll_max_timeout_secs: u64,
    pub fragment_group_ttl_secs: u64,
    /// Idle HLP connections are reaped after this long.
    pub idle_connection_secs: u64,
    /// Deadline for fan-out command delivery on a local connection.
    pub command_send_timeout_secs: u64,
    /// Broker locate request timeout.
    pub locate_timeout_secs: u64,

    pub pool: PoolSettings,

    /// Static auth seed (stand-in for the management plane).
    pub clients: Vec<Client>,
    /// Static mapping seed (stand-in for the management plane).
    pub mappings: Vec<PortMapping>,
    /// Known peer nodes at boot.
    pub peers: Vec<NodeEntry>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self {
            node_id: format!("node-{}", &uuid[..8]),
            http_listen: "0.0.0.0:7070".to_string(),
            tcp_listen: "0.0.0.0:7071".to_string(),
            quic_listen: String::new(),
            cluster_listen: "0.0.0.0:7073".to_string(),
            fragment_size: 60 * 1024,
            write_queue_capacity: 1024,
            inbound_byte_budget: 64 * 1024 * 1024,
            poll_default_timeout_secs: 30,
            poll_max_timeout_secs: 60,
            fragment_group_ttl_secs: 60,
            idle_connection_secs: 300,
            command_send_timeout_secs: 5,
            locate_timeout_secs: 30,
            pool: PoolSettings::default(),
            clients: Vec::new(),
            mappings: Vec::new(),
            peers: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Loads the config file when given, then applies env overrides.
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| format!("cannot read config {path}: {e}"))?;
                serde_json::from_str(&raw).map_err(|e| format!("cannot parse config {path}: {e}"))?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        for (var, slot) in [
            ("TUNNOX_NODE_ID", &mut self.node_id),
            ("TUNNOX_HTTP_LISTEN", &mut self.http_listen),
            ("TUNNOX_TCP_LISTEN", &mut self.tcp_listen),
            ("TUNNOX_QUIC_LISTEN", &mut self.quic_listen),
            ("TUNNOX_CLUSTER_LISTEN", &mut self.cluster_listen),
        ] {
            if let Ok(value) = std::env::var(var) {
                *slot = value;
            }
        }
    }

    pub fn poll_default_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_default_timeout_secs)
    }

    /// Clamps a client-requested poll timeout into the allowed window.
    pub fn clamp_poll_timeout(&self, requested: Option<u64>) -> Duration {
        match requested {
            Some(secs) => Duration::from_secs(secs.clamp(1, self.poll_max_timeout_secs)),
            None => self.poll_default_timeout(),
        }
    }

    pub fn fragment_group_ttl(&self) -> Duration {
        Duration::from_secs(self.fragment_group_ttl_secs)
    }

    pub fn idle_connection_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_connection_secs)
    }

    pub fn command_send_timeout(&self) -> Duration {
        Duration::from_secs(self.command_send_timeout_secs)
    }

    pub fn locate_timeout(&self) -> Duration {
        Duration::from_secs(self.locate_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_boot_a_single_node() {
        let config = GatewayConfig::default();
        assert!(config.node_id.starts_with("node-"));
        assert_eq!(config.fragment_size, 60 * 1024);
        assert_eq!(config.write_queue_capacity, 1024);
        assert_eq!(config.poll_default_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn poll_timeouts_are_clamped() {
        let config = GatewayConfig::default();
        assert_eq!(config.clamp_poll_timeout(None), Duration::from_secs(30));
        assert_eq!(config.clamp_poll_timeout(Some(0)), Duration::from_secs(1));
        assert_eq!(config.clamp_poll_timeout(Some(5)), Duration::from_secs(5));
        assert_eq!(
            config.clamp_poll_timeout(Some(600)),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn json_config_overrides_defaults() {
        let parsed: GatewayConfig = serde_json::from_str(
            r#"{
                "node_id": "node-a",
                "http_listen": "127.0.0.1:9000",
                "fragment_size": 1024,
                "clients": [{"id": 1, "auth_token": "t"}],
                "mappings": [{"id": "m1", "listen_client_id": 1, "target_client_id": 2}]
            }"#,
        )
        .unwrap();
        assert_eq!(parsed.node_id, "node-a");
        assert_eq!(parsed.fragment_size, 1024);
        assert_eq!(parsed.clients.len(), 1);
        assert_eq!(parsed.mappings[0].protocol, "tcp");
        // untouched fields keep their defaults
        assert_eq!(parsed.write_queue_capacity, 1024);
    }
}
