//! Adapter for the `codex` CLI.
//!
//! Children run `codex exec --json <prompt>`, which emits a JSONL event
//! stream; the final result and the session id are extracted from it.
//! Filesystem sandboxing maps from the permission profile:
//!
//! | permission     | sandbox flag         |
//! |----------------|----------------------|
//! | readonly       | `read-only`          |
//! | careful        | `workspace-write` (+ approval on failure) |
//! | full / shard   | `danger-full-access` |
//!
//! The codex sandbox needs Landlock (kernel >= 5.13 with
//! `/sys/kernel/security/landlock` mounted). On hosts without it the
//! sandbox flags are replaced by the CLI's bypass flag and the decision is
//! recorded on the spool's `sandbox` field.
//!
//! Continuation uses the `exec resume <session_id>` subcommand. There is
//! no transcript-injection fallback: the CLI rebuilds context only from
//! its own session files.

use std::path::Path;

use super::{Harness, HarnessAdapter, HarnessError, ParsedOutput};
use crate::spool::{Permission, SandboxPolicy, Spool};

/// Expired-session signatures on the CLI's stderr.
const SESSION_EXPIRED_FINGERPRINTS: &[&str] =
    &["session not found", "conversation not found", "no rollout found"];

/// Minimum kernel for Landlock-backed sandboxing.
const LANDLOCK_MIN_KERNEL: (u32, u32) = (5, 13);

/// The `codex` CLI adapter.
pub struct CodexHarness {
    sandbox_supported: bool,
}

impl CodexHarness {
    /// Adapter with an explicit sandbox capability.
    #[must_use]
    pub const fn new(sandbox_supported: bool) -> Self {
        Self { sandbox_supported }
    }

    /// Probe the host for Landlock support and build the adapter.
    #[must_use]
    pub fn detect() -> Self {
        let supported = landlock_supported();
        if !supported {
            tracing::warn!("host lacks landlock; codex children run with sandbox bypassed");
        }
        Self::new(supported)
    }

    const fn policy_for(&self, permission: Permission) -> SandboxPolicy {
        if !self.sandbox_supported {
            return SandboxPolicy::Bypass;
        }
        match permission {
            Permission::Readonly => SandboxPolicy::ReadOnly,
            Permission::Careful | Permission::CarefulShard => SandboxPolicy::WorkspaceWrite,
            Permission::Full | Permission::Shard => SandboxPolicy::DangerFullAccess,
        }
    }

    fn push_sandbox_args(argv: &mut Vec<String>, spool: &Spool) {
        match spool.sandbox {
            Some(SandboxPolicy::Bypass) => {
                argv.push("--dangerously-bypass-approvals-and-sandbox".to_string());
            }
            Some(policy) => {
                argv.push("--sandbox".to_string());
                argv.push(policy.to_string());
                if matches!(policy, SandboxPolicy::WorkspaceWrite) {
                    argv.push("--ask-for-approval".to_string());
                    argv.push("on-failure".to_string());
                }
            }
            None => {}
        }
    }
}

impl HarnessAdapter for CodexHarness {
    fn harness(&self) -> Harness {
        Harness::Codex
    }

    fn id_prefix(&self) -> Option<&'static str> {
        Some("codex")
    }

    fn sandbox_policy(&self, permission: Permission) -> Option<SandboxPolicy> {
        Some(self.policy_for(permission))
    }

    fn build_command(&self, spool: &Spool) -> Vec<String> {
        let mut argv = vec!["codex".to_string(), "exec".to_string(), "--json".to_string()];

        Self::push_sandbox_args(&mut argv, spool);

        if let Some(model) = &spool.model {
            argv.push("--model".to_string());
            argv.push(model.clone());
        }

        argv.push(spool.prompt.clone());
        argv
    }

    fn parse_output(&self, stdout: &str) -> Result<ParsedOutput, HarnessError> {
        let mut session_id = None;
        let mut last_message = None;

        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(event) = serde_json::from_str::<serde_json::Value>(line) else {
                continue;
            };

            if session_id.is_none() {
                session_id = event
                    .get("session_id")
                    .or_else(|| event.pointer("/msg/session_id"))
                    .or_else(|| event.get("thread_id"))
                    .and_then(|v| v.as_str())
                    .map(String::from);
            }

            if let Some(msg) = event.get("msg") {
                match msg.get("type").and_then(|t| t.as_str()) {
                    Some("agent_message") => {
                        if let Some(text) = msg.get("message").and_then(|m| m.as_str()) {
                            last_message = Some(text.to_string());
                        }
                    }
                    Some("task_complete") => {
                        if let Some(text) =
                            msg.get("last_agent_message").and_then(|m| m.as_str())
                        {
                            last_message = Some(text.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }

        match last_message {
            Some(result) => Ok(ParsedOutput { result, session_id }),
            None => Err(HarnessError::UnusableOutput {
                harness: Harness::Codex,
            }),
        }
    }

    fn output_complete(&self, stdout: &str) -> bool {
        stdout
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str::<serde_json::Value>(line.trim()).ok())
            .any(|event| {
                event.pointer("/msg/type").and_then(|t| t.as_str()) == Some("task_complete")
            })
    }

    fn resume_command(&self, session_id: &str, prompt: &str) -> Vec<String> {
        vec![
            "codex".to_string(),
            "exec".to_string(),
            "resume".to_string(),
            session_id.to_string(),
            "--json".to_string(),
            prompt.to_string(),
        ]
    }

    fn session_expired(&self, stderr: &str) -> bool {
        let lower = stderr.to_ascii_lowercase();
        SESSION_EXPIRED_FINGERPRINTS.iter().any(|f| lower.contains(f))
    }
}

/// Whether this host can enforce the codex filesystem sandbox.
fn landlock_supported() -> bool {
    kernel_at_least(LANDLOCK_MIN_KERNEL) && Path::new("/sys/kernel/security/landlock").exists()
}

fn kernel_at_least(min: (u32, u32)) -> bool {
    let Ok(release) = std::fs::read_to_string("/proc/sys/kernel/osrelease") else {
        return false;
    };
    parse_kernel_release(&release).is_some_and(|(major, minor)| (major, minor) >= min)
}

fn parse_kernel_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.trim().split(['.', '-']);
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}
