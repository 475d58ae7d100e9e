//! Router assembly.

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::kernel::Kernel;
use crate::server::openapi;
use crate::server::routes::{agents, challenges, health, jobs, sessions};

/// Build the axum application router.
pub fn build_app(kernel: Kernel) -> Router {
    let mut router = Router::new()
        .route("/v1/jobs", post(jobs::create_job).get(jobs::list_jobs))
        .route("/v1/jobs/:id", get(jobs::get_job))
        .route("/v1/jobs/:id/cancel", post(jobs::cancel_job))
        .route("/v1/jobs/:id/events", get(jobs::job_events))
        .route(
            "/v1/sessions/events",
            get(sessions::session_events).post(sessions::post_session_event),
        )
        .route("/v1/auth/challenges/events", get(challenges::challenge_events))
        .route(
            "/v1/auth/challenges/:account_name/code",
            post(challenges::submit_code),
        )
        .route("/v1/agents", get(agents::list_agents))
        .route("/v1/agent/ws", get(agents::agent_ws))
        .route("/healthz", get(health::health_handler));

    if kernel.config.enable_swagger {
        router = router.route("/openapi.json", get(openapi::openapi_handler));
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    router
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(kernel)
}
