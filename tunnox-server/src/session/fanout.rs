//! # Config Push / Kick Fan-Out
//!
//! Delivers a command to a client's control connection wherever in the
//! cluster that client sits: directly when the owner is this node, via
//! the broker's node-scoped push topic when another node owns it, and via
//! the broadcast topic when no owner is known. Delivery is at-most-once
//! best-effort; send failures are logged and never retried here.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use tunnox_protocol::packet::{CommandPacket, CommandType, TransferPacket};
use uuid::Uuid;

use crate::cluster::broker::Broker;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::session::SessionManager;
use crate::stores::NodeRegistry;

/// Broadcast topic every node subscribes to.
pub const PUSH_BROADCAST_TOPIC: &str = "tunnox.cluster.push.all";

/// Topic a single node subscribes to for targeted pushes.
pub fn push_topic(node_id: &str) -> String {
    format!("tunnox.cluster.push.{node_id}")
}

/// What rides the push topics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutEnvelope {
    pub client_id: i64,
    pub command: CommandPacket,
}

/// Routes commands to control connections across the cluster.
pub struct FanoutService {
    node_id: String,
    config: Arc<GatewayConfig>,
    sessions: Arc<SessionManager>,
    nodes: Arc<dyn NodeRegistry>,
    broker: Arc<dyn Broker>,
}

impl FanoutService {
    pub fn new(
        config: Arc<GatewayConfig>,
        sessions: Arc<SessionManager>,
        nodes: Arc<dyn NodeRegistry>,
        broker: Arc<dyn Broker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id: config.node_id.clone(),
            config,
            sessions,
            nodes,
            broker,
        })
    }

    /// Pushes a configuration update to a client, wherever it sits.
    pub async fn push_config(&self, client_id: i64, body: String) -> Result<(), GatewayError> {
        let command = CommandPacket {
            command_id: Uuid::new_v4().to_string(),
            command_type: CommandType::ConfigSet,
            command_body: body,
        };
        self.push_command(client_id, command).await
    }

    /// Force-disconnects a client, wherever it sits.
    pub async fn kick_client(&self, client_id: i64, reason: &str) -> Result<(), GatewayError> {
        let command = CommandPacket {
            command_id: Uuid::new_v4().to_string(),
            command_type: CommandType::KickClient,
            command_body: serde_json::json!({ "reason": reason }).to_string(),
        };
        self.push_command(client_id, command).await
    }

    /// Core routing: local connection, owner node's topic, or broadcast.
    pub async fn push_command(
        &self,
        client_id: i64,
        command: CommandPacket,
    ) -> Result<(), GatewayError> {
        match self.nodes.client_owner(client_id).await {
            Some(owner) if owner == self.node_id => {
                self.deliver_local(client_id, command).await;
                Ok(())
            }
            Some(owner) => {
                debug!(client_id, owner = %owner, "pushing command via owner node");
                self.publish(&push_topic(&owner), client_id, command).await
            }
            None => {
                // Offline or registry miss: whichever node holds the
                // client handles it; nobody holding it is not an error.
                info!(client_id, "owner unknown, broadcasting command");
                self.publish(PUSH_BROADCAST_TOPIC, client_id, command).await
            }
        }
    }

    async fn publish(
        &self,
        topic: &str,
        client_id: i64,
        command: CommandPacket,
    ) -> Result<(), GatewayError> {
        let envelope = FanoutEnvelope { client_id, command };
        let payload = serde_json::to_vec(&envelope)
            .map_err(|e| GatewayError::Io(format!("fanout envelope: {e}")))?;
        self.broker
            .publish(topic, payload)
            .await
            .map_err(|e| GatewayError::PeerUnavailable(e.to_string()))
    }

    /// Delivers a command to a control connection on this node. Absence
    /// of the client and send failures are logged, never errors: the
    /// command model assumes client-driven refresh for idempotent state.
    pub async fn deliver_local(&self, client_id: i64, command: CommandPacket) {
        let Some(conn) = self.sessions.control_connection(client_id) else {
            debug!(client_id, "no local control connection for pushed command");
            return;
        };

        let kick = command.command_type == CommandType::KickClient;
        let command_id = command.command_id.clone();
        let packet = TransferPacket::json_command(command);

        let send = tokio::time::timeout(self.config.command_send_timeout(), conn.send(packet));
        match send.await {
            Ok(Ok(_)) => {
                debug!(client_id, command_id = %command_id, "command delivered");
                if kick {
                    self.sessions
                        .close_connection(&conn, "kicked by operator")
                        .await;
                }
            }
            Ok(Err(e)) => {
                warn!(client_id, command_id = %command_id, error = %e, "command send failed");
            }
            Err(_) => {
                warn!(client_id, command_id = %command_id, "command send timed out");
            }
        }
    }

    /// Handles one message from a push topic (node-scoped or broadcast).
    pub async fn on_push_message(&self, payload: &[u8]) {
        let envelope: FanoutEnvelope = match serde_json::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "unreadable fanout envelope");
                return;
            }
        };
        self.deliver_local(envelope.client_id, envelope.command).await;
    }
}
