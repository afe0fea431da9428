//! # spindle-server
//!
//! The tool-call surface of the spindle supervisor: MCP protocol shapes,
//! the tool catalog with its dispatch into [`spindle_core::Supervisor`],
//! a newline-delimited JSON-RPC stdio transport, and an axum HTTP
//! transport with a `/health` endpoint.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod http;
pub mod mcp;

pub use http::serve_http;
pub use mcp::stdio::serve_stdio;
