//! MCP protocol types.
//!
//! JSON-RPC 2.0 envelope plus the initialize/tools shapes of the Model
//! Context Protocol. Wire keys are camelCase per the protocol revision.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// MCP protocol revision we speak.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC version marker.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error code: malformed JSON.
pub const PARSE_ERROR: i64 = -32700;
/// JSON-RPC error code: unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC error code: bad params.
pub const INVALID_PARAMS: i64 = -32602;
/// JSON-RPC error code: internal failure.
pub const INTERNAL_ERROR: i64 = -32603;

/// Incoming JSON-RPC request or notification.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    /// Version marker; must be `2.0`.
    #[serde(default)]
    pub jsonrpc: String,
    /// Request id; absent for notifications.
    #[serde(default)]
    pub id: Option<JsonValue>,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: JsonValue,
}

/// Outgoing JSON-RPC response.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    /// Version marker.
    pub jsonrpc: &'static str,
    /// Echoed request id.
    pub id: JsonValue,
    /// Result payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    /// Error payload on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC error payload.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    /// Error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

impl JsonRpcResponse {
    /// Successful response.
    #[must_use]
    pub fn success(id: JsonValue, result: JsonValue) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Error response.
    #[must_use]
    pub fn failure(id: JsonValue, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Server half of the initialize handshake.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Protocol revision in effect.
    pub protocol_version: &'static str,
    /// Advertised capabilities.
    pub capabilities: ServerCapabilities,
    /// Server identity.
    pub server_info: ServerInfo,
}

/// Capabilities we advertise: tools only.
#[derive(Debug, Clone, Serialize)]
pub struct ServerCapabilities {
    /// Tools capability.
    pub tools: ToolsCapability,
}

/// Tools capability details.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapability {
    /// Whether list-changed notifications are supported.
    pub list_changed: bool,
}

/// Server identity.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    /// Server name.
    pub name: &'static str,
    /// Server version.
    pub version: &'static str,
}

impl Default for InitializeResult {
    fn default() -> Self {
        Self {
            protocol_version: MCP_PROTOCOL_VERSION,
            capabilities: ServerCapabilities {
                tools: ToolsCapability::default(),
            },
            server_info: ServerInfo {
                name: "spindle",
                version: env!("CARGO_PKG_VERSION"),
            },
        }
    }
}

/// One tool descriptor.
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    /// Tool name (contractual).
    pub name: &'static str,
    /// Human-readable description.
    pub description: &'static str,
    /// JSON Schema of the arguments object.
    #[serde(rename = "inputSchema")]
    pub input_schema: JsonValue,
}

/// `tools/list` result.
#[derive(Debug, Clone, Serialize)]
pub struct ToolsListResult {
    /// Available tools.
    pub tools: Vec<Tool>,
}

/// `tools/call` parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct CallToolParams {
    /// Tool name.
    pub name: String,
    /// Arguments object.
    #[serde(default)]
    pub arguments: JsonValue,
}

/// `tools/call` result: text content, with in-band error signalling.
#[derive(Debug, Clone, Serialize)]
pub struct CallToolResult {
    /// Content blocks.
    pub content: Vec<ToolContent>,
    /// Set when the tool failed; the text carries the error.
    #[serde(rename = "isError", skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

/// One text content block.
#[derive(Debug, Clone, Serialize)]
pub struct ToolContent {
    /// Content discriminator; always `text`.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// The text payload.
    pub text: String,
}

impl CallToolResult {
    /// Successful text result.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent {
                kind: "text",
                text: text.into(),
            }],
            is_error: false,
        }
    }

    /// In-band tool error.
    #[must_use]
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent {
                kind: "text",
                text: text.into(),
            }],
            is_error: true,
        }
    }
}
