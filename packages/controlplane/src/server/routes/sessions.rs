//! Session event streaming and ingestion.

use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::{stream, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;

use super::{live_events, ready_event};
use crate::common::error::ApiError;
use crate::kernel::broker::ALL_ACCOUNTS;
use crate::kernel::Kernel;
use crate::server::auth::{AdminOrAgentScope, AdminScope};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountFilter {
    pub account_name: Option<String>,
}

/// GET /v1/sessions/events?accountName=
///
/// Omit the filter to watch every account.
pub async fn session_events(
    _: AdminScope,
    State(kernel): State<Kernel>,
    Query(filter): Query<AccountFilter>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let key = filter.account_name.as_deref().unwrap_or(ALL_ACCOUNTS);
    let rx = kernel.broker.subscribe_sessions(key);
    let stream = stream::iter([Ok(ready_event())]).chain(live_events(rx));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostSessionEventRequest {
    #[serde(default)]
    pub account_name: String,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// POST /v1/sessions/events
///
/// Agents report login/session state transitions here; admins may inject
/// them too.
pub async fn post_session_event(
    _: AdminOrAgentScope,
    State(kernel): State<Kernel>,
    Json(req): Json<PostSessionEventRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.account_name.is_empty() {
        return Err(ApiError::InvalidArgument("accountName must not be empty".into()));
    }
    kernel.broker.publish_session(
        &req.account_name,
        req.event_type.as_deref().unwrap_or("session.event"),
        req.state.as_deref().unwrap_or_default(),
        req.message,
    );
    Ok(Json(json!({ "ok": true })))
}
