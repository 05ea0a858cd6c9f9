//! # REST API Endpoints
//!
//! Read-only HTTP endpoints for querying node state. Management CRUD
//! lives in the external control plane; only the agents listing is served
//! here, for dashboards and tests.

use axum::extract::State;
use axum::Json;

use crate::session::AgentInfo;
use crate::state::AppState;

/// `GET /tunnox/v1/agents` — the connections currently attached to this
/// node, with their transport, state, and claimed client id.
pub async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentInfo>> {
    Json(state.sessions.agents())
}
