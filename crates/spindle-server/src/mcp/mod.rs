//! Model Context Protocol surface.
//!
//! Request handling is transport-agnostic: the stdio loop and the HTTP
//! route both feed [`handle_request`], which speaks the JSON-RPC envelope
//! and hands `tools/call` to the dispatch in [`tools`].

pub mod stdio;
pub mod tools;
pub mod types;

use std::sync::Arc;

use serde_json::Value as JsonValue;
use spindle_core::Supervisor;

use types::{
    CallToolParams, CallToolResult, InitializeResult, JsonRpcRequest, JsonRpcResponse,
    ToolsListResult, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND,
};

/// Handle one JSON-RPC message. Returns `None` for notifications, which
/// expect no reply.
pub async fn handle_request(
    supervisor: &Arc<Supervisor>,
    request: JsonRpcRequest,
) -> Option<JsonRpcResponse> {
    let id = request.id.clone()?;

    let response = match request.method.as_str() {
        "initialize" => match serde_json::to_value(InitializeResult::default()) {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => JsonRpcResponse::failure(id, INTERNAL_ERROR, e.to_string()),
        },
        "ping" => JsonRpcResponse::success(id, JsonValue::Object(Default::default())),
        "tools/list" => {
            let result = ToolsListResult {
                tools: tools::catalog(),
            };
            match serde_json::to_value(result) {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err(e) => JsonRpcResponse::failure(id, INTERNAL_ERROR, e.to_string()),
            }
        }
        "tools/call" => {
            let params: CallToolParams = match serde_json::from_value(request.params) {
                Ok(params) => params,
                Err(e) => {
                    return Some(JsonRpcResponse::failure(
                        id,
                        INVALID_PARAMS,
                        format!("invalid tools/call params: {e}"),
                    ));
                }
            };
            tracing::debug!(tool = %params.name, "tool call");
            let result = match tools::dispatch(supervisor, &params.name, &params.arguments).await
            {
                Ok(text) => CallToolResult::text(text),
                Err(message) => CallToolResult::error(message),
            };
            match serde_json::to_value(result) {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err(e) => JsonRpcResponse::failure(id, INTERNAL_ERROR, e.to_string()),
            }
        }
        other => JsonRpcResponse::failure(
            id,
            METHOD_NOT_FOUND,
            format!("unknown method '{other}'"),
        ),
    };
    Some(response)
}
