//! Bearer-token scopes.
//!
//! Two disjoint scopes: "admin" (the single `ADMIN_API_KEY` token) and
//! "agent" (any of `AGENT_API_KEYS`). Handlers opt in by taking the scope
//! extractor as an argument; a missing or wrong token rejects with a bare
//! 401 before the handler runs.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use crate::common::error::ApiError;
use crate::kernel::Kernel;

/// Admin scope: job submission, inspection and event streams.
pub struct AdminScope;

/// Agent scope: the tunnel endpoint.
pub struct AgentScope;

/// Either scope; session event ingestion accepts both.
pub struct AdminOrAgentScope;

fn bearer(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn is_admin(kernel: &Kernel, token: &str) -> bool {
    token == kernel.config.admin_api_key
}

fn is_agent(kernel: &Kernel, token: &str) -> bool {
    kernel.config.agent_api_keys.iter().any(|k| k == token)
}

#[async_trait]
impl FromRequestParts<Kernel> for AdminScope {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, kernel: &Kernel) -> Result<Self, ApiError> {
        match bearer(parts) {
            Some(token) if is_admin(kernel, token) => Ok(AdminScope),
            _ => Err(ApiError::Unauthorized),
        }
    }
}

#[async_trait]
impl FromRequestParts<Kernel> for AgentScope {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, kernel: &Kernel) -> Result<Self, ApiError> {
        match bearer(parts) {
            Some(token) if is_agent(kernel, token) => Ok(AgentScope),
            _ => Err(ApiError::Unauthorized),
        }
    }
}

#[async_trait]
impl FromRequestParts<Kernel> for AdminOrAgentScope {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, kernel: &Kernel) -> Result<Self, ApiError> {
        match bearer(parts) {
            Some(token) if is_admin(kernel, token) || is_agent(kernel, token) => {
                Ok(AdminOrAgentScope)
            }
            _ => Err(ApiError::Unauthorized),
        }
    }
}
