//! Newline-delimited JSON-RPC over stdio.
//!
//! The framing the MCP stdio transport uses: one JSON-RPC message per
//! line on stdin, one response per line on stdout. Diagnostics must go to
//! stderr (the tracing writer is configured there by the binary) so the
//! protocol stream stays clean.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use spindle_core::Supervisor;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use super::handle_request;
use super::types::{JsonRpcRequest, JsonRpcResponse, PARSE_ERROR};

/// Serve MCP over stdin/stdout until the parent closes the stream.
pub async fn serve_stdio(supervisor: Arc<Supervisor>) -> std::io::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    tracing::info!("serving MCP on stdio");
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<JsonRpcRequest>(&line) {
            Ok(request) => handle_request(&supervisor, request).await,
            Err(e) => Some(JsonRpcResponse::failure(
                JsonValue::Null,
                PARSE_ERROR,
                format!("parse error: {e}"),
            )),
        };

        if let Some(response) = response {
            let mut encoded = serde_json::to_vec(&response)?;
            encoded.push(b'\n');
            stdout.write_all(&encoded).await?;
            stdout.flush().await?;
        }
    }
    tracing::info!("stdin closed; stdio transport done");
    Ok(())
}
