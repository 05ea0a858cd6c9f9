//! # Command Dispatch
//!
//! JsonCommand packets carry a typed command envelope. Handlers are
//! registered per [`CommandType`]; each dispatch is single-shot and
//! produces a response command packet with the requester's `command_id`,
//! which the session manager routes back over the same stream. Unknown
//! types produce an `unsupported_command` response rather than an error —
//! the command model is fire-and-correlate.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use tunnox_protocol::packet::{CommandPacket, CommandType};

use crate::error::GatewayError;

/// Who issued the command, for handlers that care.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub connection_id: String,
    pub client_id: i64,
}

/// The JSON document every response's `command_body` carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponseBody {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResponseBody {
    pub fn ok(data: Option<serde_json::Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    fn into_json(self) -> String {
        serde_json::to_string(&self).unwrap_or_else(|_| "{\"success\":false}".to_string())
    }
}

/// A registered command handler.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &CommandContext,
        command: &CommandPacket,
    ) -> Result<CommandResponseBody, GatewayError>;
}

/// Per-type handler registry.
#[derive(Default)]
pub struct CommandDispatcher {
    handlers: RwLock<HashMap<CommandType, Arc<dyn CommandHandler>>>,
}

impl CommandDispatcher {
    pub fn new() -> Self {
        let dispatcher = Self::default();
        dispatcher.register(CommandType::HealthCheck, Arc::new(HealthCheckHandler));
        dispatcher
    }

    pub fn register(&self, command_type: CommandType, handler: Arc<dyn CommandHandler>) {
        self.handlers
            .write()
            .expect("dispatcher lock poisoned")
            .insert(command_type, handler);
    }

    /// Runs the matching handler and shapes the correlated response.
    pub async fn dispatch(&self, ctx: &CommandContext, command: &CommandPacket) -> CommandPacket {
        let handler = self
            .handlers
            .read()
            .expect("dispatcher lock poisoned")
            .get(&command.command_type)
            .cloned();

        let body = match handler {
            Some(handler) => match handler.handle(ctx, command).await {
                Ok(body) => body,
                Err(err) => {
                    debug!(
                        command_id = %command.command_id,
                        error = %err,
                        "command handler failed"
                    );
                    CommandResponseBody::fail(err.to_string())
                }
            },
            None => CommandResponseBody::fail(
                GatewayError::UnsupportedCommand(format!("{:?}", command.command_type))
                    .to_string(),
            ),
        };

        CommandPacket {
            command_id: command.command_id.clone(),
            command_type: command.command_type,
            command_body: body.into_json(),
        }
    }
}

/// No-op probe handler, registered by default.
struct HealthCheckHandler;

#[async_trait]
impl CommandHandler for HealthCheckHandler {
    async fn handle(
        &self,
        _ctx: &CommandContext,
        _command: &CommandPacket,
    ) -> Result<CommandResponseBody, GatewayError> {
        Ok(CommandResponseBody::ok(Some(
            serde_json::json!({ "status": "ok" }),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CommandContext {
        CommandContext {
            connection_id: "conn_t0000000".into(),
            client_id: 1,
        }
    }

    fn command(command_type: CommandType) -> CommandPacket {
        CommandPacket {
            command_id: "cmd-77".into(),
            command_type,
            command_body: String::new(),
        }
    }

    #[tokio::test]
    async fn responses_echo_the_command_id() {
        let dispatcher = CommandDispatcher::new();
        let response = dispatcher.dispatch(&ctx(), &command(CommandType::HealthCheck)).await;
        assert_eq!(response.command_id, "cmd-77");
        let body: CommandResponseBody = serde_json::from_str(&response.command_body).unwrap();
        assert!(body.success);
    }

    #[tokio::test]
    async fn unknown_types_get_an_unsupported_response() {
        let dispatcher = CommandDispatcher::new();
        let response = dispatcher.dispatch(&ctx(), &command(CommandType::KickClient)).await;
        let body: CommandResponseBody = serde_json::from_str(&response.command_body).unwrap();
        assert!(!body.success);
        assert!(body.error.unwrap().contains("unsupported"));
    }

    #[tokio::test]
    async fn registered_handlers_take_over() {
        struct Always;
        #[async_trait]
        impl CommandHandler for Always {
            async fn handle(
                &self,
                _ctx: &CommandContext,
                _command: &CommandPacket,
            ) -> Result<CommandResponseBody, GatewayError> {
                Ok(CommandResponseBody::ok(None))
            }
        }

        let dispatcher = CommandDispatcher::new();
        dispatcher.register(CommandType::ConfigGet, Arc::new(Always));
        let response = dispatcher.dispatch(&ctx(), &command(CommandType::ConfigGet)).await;
        let body: CommandResponseBody = serde_json::from_str(&response.command_body).unwrap();
        assert!(body.success);
    }

    #[tokio::test]
    async fn handler_errors_become_failed_responses() {
        struct Failing;
        #[async_trait]
        impl CommandHandler for Failing {
            async fn handle(
                &self,
                _ctx: &CommandContext,
                _command: &CommandPacket,
            ) -> Result<CommandResponseBody, GatewayError> {
                Err(GatewayError::NotAuthorized("nope".into()))
            }
        }

        let dispatcher = CommandDispatcher::new();
        dispatcher.register(CommandType::ConfigSet, Arc::new(Failing));
        let response = dispatcher.dispatch(&ctx(), &command(CommandType::ConfigSet)).await;
        let body: CommandResponseBody = serde_json::from_str(&response.command_body).unwrap();
        assert!(!body.success);
    }
}
