//! Auth-challenge event streaming and code submission.

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::{stream, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;

use super::sessions::AccountFilter;
use super::{live_events, ready_event};
use crate::common::error::ApiError;
use crate::kernel::broker::ALL_ACCOUNTS;
use crate::kernel::Kernel;
use crate::server::auth::AdminScope;

/// GET /v1/auth/challenges/events?accountName=
pub async fn challenge_events(
    _: AdminScope,
    State(kernel): State<Kernel>,
    Query(filter): Query<AccountFilter>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let key = filter.account_name.as_deref().unwrap_or(ALL_ACCOUNTS);
    let rx = kernel.broker.subscribe_challenges(key);
    let stream = stream::iter([Ok(ready_event())]).chain(live_events(rx));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn default_code_type() -> String {
    "email".to_string()
}

#[derive(Debug, Deserialize)]
pub struct SubmitCodeRequest {
    #[serde(default)]
    pub code: String,
    #[serde(rename = "type", default = "default_code_type")]
    pub challenge_type: String,
}

/// POST /v1/auth/challenges/{accountName}/code
pub async fn submit_code(
    _: AdminScope,
    State(kernel): State<Kernel>,
    Path(account_name): Path<String>,
    Json(req): Json<SubmitCodeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.code.is_empty() {
        return Err(ApiError::InvalidArgument("code must not be empty".into()));
    }
    tracing::info!(account = %account_name, challenge_type = %req.challenge_type, "challenge code submitted");
    kernel
        .broker
        .publish_challenge(&account_name, &req.challenge_type, Some(req.code), None);
    Ok(Json(json!({ "ok": true })))
}
