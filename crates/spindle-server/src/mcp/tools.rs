//! Tool catalog and dispatch.
//!
//! Every operation the supervisor exposes is one MCP tool; this module
//! owns the JSON-Schema descriptors and the thin argument plumbing into
//! [`Supervisor`]. Tool failures are returned in-band as error text, the
//! way a parent agent expects to see them.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::{json, Value as JsonValue};
use spindle_core::supervisor::{SpinRequest, Supervisor};
use spindle_core::wait::WaitMode;

use super::types::Tool;

/// The tool catalog, in the order the parent agent sees it.
#[must_use]
pub fn catalog() -> Vec<Tool> {
    vec![
        Tool {
            name: "spin",
            description: "Spawn a child coding agent for a task. Returns immediately \
                          with a spool_id; use unspool to fetch the result later.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "prompt": {"type": "string", "description": "The task for the child agent"},
                    "harness": {"type": "string", "enum": ["claude", "codex"], "description": "Child agent CLI (default: claude)"},
                    "permission": {"type": "string", "enum": ["readonly", "careful", "full", "shard", "careful+shard"], "description": "Permission profile (default: careful)"},
                    "shard": {"type": "boolean", "description": "Run in an isolated git worktree"},
                    "system_prompt": {"type": "string", "description": "Extra system instructions"},
                    "working_dir": {"type": "string", "description": "Directory the child runs in (required)"},
                    "allowed_tools": {"type": "string", "description": "Explicit tool restriction, overriding the profile"},
                    "tags": {"type": "string", "description": "Comma-separated labels"},
                    "model": {"type": "string", "description": "Model tag, e.g. haiku or sonnet"},
                    "timeout": {"type": "integer", "description": "Kill deadline in seconds"}
                },
                "required": ["prompt"]
            }),
        },
        Tool {
            name: "unspool",
            description: "Fetch the full record of a spool, including result or error.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "spool_id": {"type": "string"}
                },
                "required": ["spool_id"]
            }),
        },
        Tool {
            name: "spools",
            description: "List all spools (running and completed), newest first.",
            input_schema: json!({"type": "object", "properties": {}}),
        },
        Tool {
            name: "spin_wait",
            description: "Block until spools finish. gather waits for all and returns \
                          records in input order; stream returns them in completion order.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "spool_ids": {"type": "string", "description": "Comma-separated spool ids"},
                    "mode": {"type": "string", "enum": ["gather", "stream"], "description": "Wait mode (default: gather)"},
                    "timeout": {"type": "integer", "description": "Waiter deadline in seconds; never cancels the spools"}
                },
                "required": ["spool_ids"]
            }),
        },
        Tool {
            name: "respin",
            description: "Continue an earlier session with a follow-up prompt. Falls back \
                          to transcript injection if the session has expired.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "session_id": {"type": "string"},
                    "prompt": {"type": "string"}
                },
                "required": ["session_id", "prompt"]
            }),
        },
        Tool {
            name: "spin_drop",
            description: "Cancel a running spool. The killed state is visible after the \
                          next monitor tick.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "spool_id": {"type": "string"}
                },
                "required": ["spool_id"]
            }),
        },
        Tool {
            name: "spool_peek",
            description: "See the tail of a running spool's live output.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "spool_id": {"type": "string"},
                    "lines": {"type": "integer", "description": "Lines from the end (default: 50)"}
                },
                "required": ["spool_id"]
            }),
        },
        Tool {
            name: "spool_retry",
            description: "Re-run a spool with the same parameters. Returns the new spool_id.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "spool_id": {"type": "string"}
                },
                "required": ["spool_id"]
            }),
        },
        Tool {
            name: "shard_status",
            description: "Repository state of a spool's shard worktree.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "spool_id": {"type": "string"}
                },
                "required": ["spool_id"]
            }),
        },
        Tool {
            name: "shard_merge",
            description: "Merge a shard's branch back and clean up the worktree. \
                          Conflicts are reported without completing the merge.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "spool_id": {"type": "string"},
                    "keep_branch": {"type": "boolean", "description": "Keep the branch after merging"}
                },
                "required": ["spool_id"]
            }),
        },
        Tool {
            name: "shard_abandon",
            description: "Remove a shard worktree without merging.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "spool_id": {"type": "string"},
                    "keep_branch": {"type": "boolean", "description": "Keep the branch for later"}
                },
                "required": ["spool_id"]
            }),
        },
        Tool {
            name: "spool_dashboard",
            description: "Single-view dashboard: counts, running spools, recent \
                          completions, and items needing attention.",
            input_schema: json!({"type": "object", "properties": {}}),
        },
        Tool {
            name: "spool_stats",
            description: "Record counts by status plus the store's time range.",
            input_schema: json!({"type": "object", "properties": {}}),
        },
        Tool {
            name: "spool_info",
            description: "Full spool record plus transcript availability, for debugging.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "spool_id": {"type": "string"}
                },
                "required": ["spool_id"]
            }),
        },
        Tool {
            name: "spool_search",
            description: "Case-insensitive substring search over prompts and results.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "field": {"type": "string", "enum": ["prompt", "result", "both"], "description": "Where to search (default: both)"}
                },
                "required": ["query"]
            }),
        },
        Tool {
            name: "spool_results",
            description: "Bulk fetch spool results filtered by status and age.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "status": {"type": "string", "enum": ["complete", "error", "running", "all"], "description": "Status filter (default: complete)"},
                    "since": {"type": "string", "enum": ["1h", "6h", "12h", "1d", "7d"], "description": "Age filter"},
                    "limit": {"type": "integer", "description": "Max results (default: 10)"}
                }
            }),
        },
        Tool {
            name: "spool_grep",
            description: "Regex search through spool results.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string", "description": "Regular expression"}
                },
                "required": ["pattern"]
            }),
        },
        Tool {
            name: "spool_export",
            description: "Export spool records to a JSON or Markdown file.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "spool_ids": {"type": "string", "description": "Comma-separated ids, or 'all'"},
                    "format": {"type": "string", "enum": ["json", "md"], "description": "Output format (default: json)"},
                    "output_path": {"type": "string", "description": "Target file (default: <root>/export.<ext>)"}
                },
                "required": ["spool_ids"]
            }),
        },
    ]
}

/// Run one tool call against the supervisor. `Err` carries the in-band
/// error text shown to the parent agent.
pub async fn dispatch(
    supervisor: &Supervisor,
    name: &str,
    arguments: &JsonValue,
) -> Result<String, String> {
    match name {
        "spin" => {
            let request: SpinRequest = serde_json::from_value(arguments.clone())
                .map_err(|e| format!("invalid spin arguments: {e}"))?;
            supervisor.spin(request).map_err(to_message)
        }
        "unspool" => {
            let spool = supervisor
                .unspool(required_str(arguments, "spool_id")?)
                .map_err(to_message)?;
            pretty(&spool)
        }
        "spools" => pretty(&supervisor.spools()),
        "spin_wait" => {
            let ids: Vec<String> = required_str(arguments, "spool_ids")?
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            let mode = match opt_str(arguments, "mode") {
                Some(name) => WaitMode::parse(name).map_err(|e| e.to_string())?,
                None => WaitMode::default(),
            };
            let timeout = opt_u64(arguments, "timeout").map(Duration::from_secs);
            let report = supervisor
                .spin_wait(&ids, mode, timeout)
                .await
                .map_err(to_message)?;
            pretty(&json!({
                "records": report.records,
                "pending": report.pending,
            }))
        }
        "respin" => supervisor
            .respin(
                required_str(arguments, "session_id")?,
                required_str(arguments, "prompt")?,
            )
            .map_err(to_message),
        "spin_drop" => supervisor
            .spin_drop(required_str(arguments, "spool_id")?)
            .map_err(to_message),
        "spool_peek" => {
            let lines = opt_u64(arguments, "lines").unwrap_or(50) as usize;
            supervisor
                .spool_peek(required_str(arguments, "spool_id")?, lines)
                .map_err(to_message)
        }
        "spool_retry" => supervisor
            .spool_retry(required_str(arguments, "spool_id")?)
            .map_err(to_message),
        "shard_status" => {
            let report = supervisor
                .shard_status(required_str(arguments, "spool_id")?)
                .map_err(to_message)?;
            pretty(&report)
        }
        "shard_merge" => {
            let outcome = supervisor
                .shard_merge(
                    required_str(arguments, "spool_id")?,
                    opt_bool(arguments, "keep_branch"),
                )
                .map_err(to_message)?;
            pretty(&outcome)
        }
        "shard_abandon" => supervisor
            .shard_abandon(
                required_str(arguments, "spool_id")?,
                opt_bool(arguments, "keep_branch"),
            )
            .map_err(to_message),
        "spool_dashboard" => pretty(&supervisor.dashboard()),
        "spool_stats" => pretty(&supervisor.spool_stats()),
        "spool_info" => {
            let info = supervisor
                .spool_info(required_str(arguments, "spool_id")?)
                .map_err(to_message)?;
            pretty(&info)
        }
        "spool_search" => {
            let matches = supervisor
                .spool_search(
                    required_str(arguments, "query")?,
                    opt_str(arguments, "field").unwrap_or("both"),
                )
                .map_err(to_message)?;
            pretty(&matches)
        }
        "spool_results" => {
            let entries = supervisor
                .spool_results(
                    opt_str(arguments, "status").unwrap_or("complete"),
                    opt_str(arguments, "since"),
                    opt_u64(arguments, "limit").unwrap_or(10) as usize,
                )
                .map_err(to_message)?;
            pretty(&entries)
        }
        "spool_grep" => {
            let matches = supervisor
                .spool_grep(required_str(arguments, "pattern")?)
                .map_err(to_message)?;
            pretty(&matches)
        }
        "spool_export" => {
            let (path, count) = supervisor
                .spool_export(
                    required_str(arguments, "spool_ids")?,
                    opt_str(arguments, "format").unwrap_or("json"),
                    opt_str(arguments, "output_path").map(PathBuf::from),
                )
                .map_err(to_message)?;
            Ok(format!("exported {count} spools to {}", path.display()))
        }
        other => Err(format!("unknown tool '{other}'")),
    }
}

fn to_message(error: spindle_core::supervisor::SupervisorError) -> String {
    format!("Error: {error}")
}

fn pretty<T: serde::Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("failed to encode result: {e}"))
}

fn required_str<'a>(arguments: &'a JsonValue, key: &str) -> Result<&'a str, String> {
    opt_str(arguments, key).ok_or_else(|| format!("missing required argument '{key}'"))
}

fn opt_str<'a>(arguments: &'a JsonValue, key: &str) -> Option<&'a str> {
    arguments.get(key).and_then(|v| v.as_str())
}

fn opt_u64(arguments: &JsonValue, key: &str) -> Option<u64> {
    arguments.get(key).and_then(serde_json::Value::as_u64)
}

fn opt_bool(arguments: &JsonValue, key: &str) -> bool {
    arguments
        .get(key)
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}
