//! Adapter for the `claude` CLI.
//!
//! Children run `claude -p <prompt> --output-format json`, so a finished
//! child leaves a single JSON object on stdout with `result` and
//! `session_id` fields. The CLI does not always exit promptly after
//! writing that object, so `output_complete` lets the monitor finalize
//! from the artifact while the pid is still alive. Continuation uses
//! `--resume <session_id>`; when the session has expired upstream the
//! fallback embeds the saved transcript into a fresh prompt.
//!
//! A child that exits non-zero but still wrote a parseable result
//! finalizes as complete: the CLI uses non-zero codes for benign
//! conditions such as a cancelled sub-operation.

use super::{Harness, HarnessAdapter, HarnessError, ParsedOutput};
use crate::spool::Spool;

/// Expired-session signature on the CLI's stderr.
const SESSION_EXPIRED_FINGERPRINT: &str = "No conversation found with session ID";

/// The `claude` CLI adapter.
pub struct ClaudeHarness;

impl HarnessAdapter for ClaudeHarness {
    fn harness(&self) -> Harness {
        Harness::Claude
    }

    fn build_command(&self, spool: &Spool) -> Vec<String> {
        let mut argv = vec![
            "claude".to_string(),
            "-p".to_string(),
            spool.prompt.clone(),
            "--output-format".to_string(),
            "json".to_string(),
        ];

        if let Some(model) = &spool.model {
            argv.push("--model".to_string());
            argv.push(model.clone());
        }

        // Non-interactive children cannot answer permission prompts.
        argv.push("--permission-mode".to_string());
        if spool.permission.bypasses_approvals() {
            argv.push("bypassPermissions".to_string());
        } else {
            argv.push("acceptEdits".to_string());
        }

        if let Some(system_prompt) = &spool.system_prompt {
            argv.push("--system-prompt".to_string());
            argv.push(system_prompt.clone());
        }

        if let Some(tools) = &spool.allowed_tools {
            argv.push("--allowedTools".to_string());
            argv.push(tools.clone());
        }

        argv
    }

    fn parse_output(&self, stdout: &str) -> Result<ParsedOutput, HarnessError> {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Err(HarnessError::UnusableOutput {
                harness: Harness::Claude,
            });
        }

        if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
            if let Some(result) = value.get("result").and_then(|r| r.as_str()) {
                return Ok(ParsedOutput {
                    result: result.to_string(),
                    session_id: value
                        .get("session_id")
                        .and_then(|s| s.as_str())
                        .map(String::from),
                });
            }
        }

        // Plain-text fallback: the whole output is the result, with an
        // optional trailing "Session ID: <token>" line.
        let mut result = trimmed.to_string();
        let mut session_id = None;
        if let Some(last) = trimmed.lines().last() {
            if let Some(token) = last
                .strip_prefix("Session ID:")
                .or_else(|| last.strip_prefix("session id:"))
            {
                session_id = Some(token.trim().to_string());
                result = trimmed[..trimmed.len() - last.len()].trim_end().to_string();
            }
        }
        Ok(ParsedOutput { result, session_id })
    }

    fn output_complete(&self, stdout: &str) -> bool {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return false;
        }
        serde_json::from_str::<serde_json::Value>(trimmed)
            .map(|v| v.get("result").is_some() || v.get("error").is_some())
            .unwrap_or(false)
    }

    fn resume_command(&self, session_id: &str, prompt: &str) -> Vec<String> {
        vec![
            "claude".to_string(),
            "-p".to_string(),
            prompt.to_string(),
            "--resume".to_string(),
            session_id.to_string(),
            "--output-format".to_string(),
            "json".to_string(),
        ]
    }

    fn fallback_resume(&self, transcript: &str, prompt: &str) -> Option<Vec<String>> {
        let context_prompt = format!(
            "Previous conversation transcript:\n\n{transcript}\n\n---\n\n\
             Continue from above. New message: {prompt}"
        );
        Some(vec![
            "claude".to_string(),
            "-p".to_string(),
            context_prompt,
            "--output-format".to_string(),
            "json".to_string(),
        ])
    }

    fn session_expired(&self, stderr: &str) -> bool {
        stderr.contains(SESSION_EXPIRED_FINGERPRINT)
    }
}
