//! Job submission, inspection, cancellation and event streaming.

use std::collections::HashMap;
use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::{stream, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;

use super::{live_events, ready_event};
use crate::common::error::ApiError;
use crate::kernel::broker::JobEvent;
use crate::kernel::store::NewJob;
use crate::kernel::Kernel;
use crate::server::auth::AdminScope;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

impl From<CreateJobRequest> for NewJob {
    fn from(req: CreateJobRequest) -> Self {
        NewJob {
            action: req.action,
            region: req.region,
            targets: req.targets,
            payload: req.payload,
            meta: req.meta,
        }
    }
}

/// POST /v1/jobs
pub async fn create_job(
    _: AdminScope,
    State(kernel): State<Kernel>,
    Json(req): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let created = kernel.store.create_job(req.into()).await?;
    tracing::info!(
        job_id = %created.job.id,
        action = %created.job.action,
        tasks = created.tasks.len(),
        "job accepted"
    );
    let location = format!("/v1/jobs/{}", created.job.id);
    Ok((
        StatusCode::ACCEPTED,
        [(header::LOCATION, location)],
        Json(json!({ "job": created.job })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub limit: Option<i64>,
}

/// GET /v1/jobs?limit=
pub async fn list_jobs(
    _: AdminScope,
    State(kernel): State<Kernel>,
    Query(query): Query<ListJobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let jobs = kernel.store.list_jobs(query.limit.unwrap_or(50)).await?;
    Ok(Json(json!({ "jobs": jobs })))
}

/// GET /v1/jobs/{id}
pub async fn get_job(
    _: AdminScope,
    State(kernel): State<Kernel>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = kernel.store.get_job(&id).await?;
    Ok(Json(json!({ "job": detail.job, "tasks": detail.tasks })))
}

/// POST /v1/jobs/{id}/cancel
pub async fn cancel_job(
    _: AdminScope,
    State(kernel): State<Kernel>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    kernel.store.cancel_job(&id).await?;
    tracing::info!(job_id = %id, "job canceled");
    Ok(Json(json!({ "ok": true })))
}

/// GET /v1/jobs/{id}/events
///
/// Events are never replayed, and a subscriber can only learn the job id
/// after creation, so the stream re-announces the job as `job.created`
/// right after the `ready` sentinel.
pub async fn job_events(
    _: AdminScope,
    State(kernel): State<Kernel>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let detail = kernel.store.get_job(&id).await?;
    let rx = kernel.broker.subscribe_job(&id);

    let created = JobEvent::new(
        &id,
        "job.created",
        Some(json!({ "status": detail.job.status, "action": detail.job.action })),
    );
    let mut initial = vec![Ok(ready_event())];
    if let Ok(event) = Event::default().event("job.created").json_data(&created) {
        initial.push(Ok(event));
    }

    let stream = stream::iter(initial).chain(live_events(rx));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
