//! Minimal OpenAPI 3 document, mounted when `ENABLE_SWAGGER` is set.

use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

/// GET /openapi.json
pub async fn openapi_handler() -> impl IntoResponse {
    Json(json!({
        "openapi": "3.0.3",
        "info": {
            "title": "Steam automation control plane",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "components": {
            "securitySchemes": {
                "bearer": { "type": "http", "scheme": "bearer" }
            }
        },
        "security": [{ "bearer": [] }],
        "paths": {
            "/v1/jobs": {
                "post": {
                    "summary": "Submit a job",
                    "responses": { "202": { "description": "Job accepted" }, "400": { "description": "Invalid request" } }
                },
                "get": {
                    "summary": "List jobs, newest first",
                    "parameters": [{ "name": "limit", "in": "query", "schema": { "type": "integer", "minimum": 1, "maximum": 500 } }],
                    "responses": { "200": { "description": "Jobs" } }
                }
            },
            "/v1/jobs/{id}": {
                "get": {
                    "summary": "Fetch a job and its tasks",
                    "responses": { "200": { "description": "Job detail" }, "404": { "description": "Unknown job" } }
                }
            },
            "/v1/jobs/{id}/cancel": {
                "post": {
                    "summary": "Cancel a job and its pending tasks",
                    "responses": { "200": { "description": "Canceled" }, "404": { "description": "Unknown job" } }
                }
            },
            "/v1/jobs/{id}/events": {
                "get": {
                    "summary": "Stream job events (SSE)",
                    "responses": { "200": { "description": "Event stream" }, "404": { "description": "Unknown job" } }
                }
            },
            "/v1/sessions/events": {
                "get": {
                    "summary": "Stream session events (SSE)",
                    "parameters": [{ "name": "accountName", "in": "query", "schema": { "type": "string" } }],
                    "responses": { "200": { "description": "Event stream" } }
                },
                "post": {
                    "summary": "Publish a session event",
                    "responses": { "200": { "description": "Published" }, "400": { "description": "Invalid request" } }
                }
            },
            "/v1/auth/challenges/events": {
                "get": {
                    "summary": "Stream auth challenges (SSE)",
                    "parameters": [{ "name": "accountName", "in": "query", "schema": { "type": "string" } }],
                    "responses": { "200": { "description": "Event stream" } }
                }
            },
            "/v1/auth/challenges/{accountName}/code": {
                "post": {
                    "summary": "Submit a challenge code",
                    "responses": { "200": { "description": "Accepted" }, "400": { "description": "Invalid request" } }
                }
            },
            "/v1/agents": {
                "get": {
                    "summary": "List connected agents",
                    "responses": { "200": { "description": "Agents" } }
                }
            },
            "/v1/agent/ws": {
                "get": {
                    "summary": "Agent tunnel (WebSocket upgrade)",
                    "parameters": [
                        { "name": "agentId", "in": "query", "required": true, "schema": { "type": "string" } },
                        { "name": "region", "in": "query", "required": true, "schema": { "type": "string" } }
                    ],
                    "responses": { "101": { "description": "Switching protocols" }, "400": { "description": "Missing parameters" } }
                }
            },
            "/healthz": {
                "get": {
                    "summary": "Liveness probe",
                    "security": [],
                    "responses": { "200": { "description": "OK" } }
                }
            }
        }
    }))
}
