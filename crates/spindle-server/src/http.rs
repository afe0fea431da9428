//! HTTP transport: the MCP endpoint and the health check.
//!
//! `POST /mcp` accepts the same JSON-RPC envelope as the stdio transport;
//! `GET /health` answers with the supervisor's liveness snapshot for
//! monitoring and service-manager watchdogs.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value as JsonValue;
use spindle_core::Supervisor;

use crate::mcp::handle_request;
use crate::mcp::types::{JsonRpcRequest, JsonRpcResponse, PARSE_ERROR};

/// Shared state of the HTTP routes.
#[derive(Clone)]
pub struct AppState {
    /// The supervisor behind every route.
    pub supervisor: Arc<Supervisor>,
}

/// Build the router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/mcp", post(mcp_endpoint))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve HTTP until the task is aborted.
pub async fn serve_http(supervisor: Arc<Supervisor>, addr: SocketAddr) -> std::io::Result<()> {
    let app = router(AppState { supervisor });
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "serving MCP over HTTP");
    axum::serve(listener, app).await
}

async fn mcp_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<JsonValue>,
) -> Json<JsonValue> {
    let response = match serde_json::from_value::<JsonRpcRequest>(payload) {
        Ok(request) => handle_request(&state.supervisor, request).await,
        Err(e) => Some(JsonRpcResponse::failure(
            JsonValue::Null,
            PARSE_ERROR,
            format!("parse error: {e}"),
        )),
    };
    match response {
        Some(response) => {
            Json(serde_json::to_value(response).unwrap_or(JsonValue::Null))
        }
        // Notifications get an empty acknowledgement body.
        None => Json(JsonValue::Object(Default::default())),
    }
}

async fn health(State(state): State<AppState>) -> Json<JsonValue> {
    Json(serde_json::to_value(state.supervisor.health()).unwrap_or(JsonValue::Null))
}

#[cfg(test)]
mod tests {
    use spindle_core::config::SpindleConfig;

    use super::*;

    #[tokio::test]
    async fn health_payload_shape() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor =
            Arc::new(Supervisor::new(SpindleConfig::with_root(dir.path())).unwrap());
        let state = AppState {
            supervisor: Arc::clone(&supervisor),
        };

        let Json(value) = health(State(state)).await;
        assert_eq!(value["status"], "healthy");
        assert_eq!(value["running_spools"], 0);
        assert!(value["max_concurrent"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn mcp_endpoint_answers_initialize() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor =
            Arc::new(Supervisor::new(SpindleConfig::with_root(dir.path())).unwrap());
        let state = AppState { supervisor };

        let Json(value) = mcp_endpoint(
            State(state),
            Json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": {}
            })),
        )
        .await;
        assert_eq!(value["result"]["serverInfo"]["name"], "spindle");
    }
}
