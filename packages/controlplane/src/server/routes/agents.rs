//! Agent inspection and the tunnel upgrade endpoint.

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::common::error::ApiError;
use crate::kernel::registry::AgentDescriptor;
use crate::kernel::tunnel::{run_tunnel, TunnelParams};
use crate::kernel::Kernel;
use crate::server::auth::{AdminScope, AgentScope};

/// GET /v1/agents
pub async fn list_agents(_: AdminScope, State(kernel): State<Kernel>) -> impl IntoResponse {
    let agents: Vec<AgentDescriptor> = kernel
        .registry
        .list()
        .iter()
        .map(|agent| agent.descriptor())
        .collect();
    Json(json!({ "agents": agents }))
}

/// GET /v1/agent/ws?agentId=&region=
pub async fn agent_ws(
    _: AgentScope,
    State(kernel): State<Kernel>,
    Query(params): Query<TunnelParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    if params.agent_id.is_empty() || params.region.is_empty() {
        return Err(ApiError::InvalidArgument(
            "agentId and region are required".into(),
        ));
    }
    Ok(ws.on_upgrade(move |socket| run_tunnel(kernel, params, socket)))
}
