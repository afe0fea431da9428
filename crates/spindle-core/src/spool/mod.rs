//! Spool data model.
//!
//! A spool is the durable record of one delegated task: what was asked,
//! which harness ran it, where its child process writes output, and how it
//! ended. Records are persisted one-file-per-spool by [`store::SpoolStore`]
//! and mutated only by the monitor loop and explicit control operations.

pub mod id;
pub mod store;

use std::path::PathBuf;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::harness::Harness;

/// Lifecycle state of a spool.
///
/// ```text
/// pending --admit--> running --exit ok--> complete
///                        \--exit err---> error
///                        \--deadline---> timeout
///                        \--cancel----->  killed
/// ```
///
/// The four right-hand states are terminal; a spool never leaves one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpoolStatus {
    /// Record created, child not yet started.
    Pending,
    /// Detached child is (believed) alive.
    Running,
    /// Child finished and its output parsed; `result` is populated.
    Complete,
    /// Child failed or produced unusable output; `error` is populated.
    Error,
    /// Killed by the timeout watchdog; `error` is populated.
    Timeout,
    /// Cancelled via `spin_drop`; `error` is populated.
    Killed,
}

impl SpoolStatus {
    /// Returns `true` for the four terminal states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Timeout | Self::Killed)
    }

    /// Returns `true` while a child may still be alive.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for SpoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Killed => "killed",
        };
        write!(f, "{s}")
    }
}

/// Permission profile resolved at admission.
///
/// Profiles map to harness-specific restrictions: an allowed-tools list for
/// the claude CLI, a sandbox flag for the codex CLI. The `shard` variants
/// additionally run the child inside an isolated worktree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Permission {
    /// Read/search tools only.
    #[serde(rename = "readonly")]
    Readonly,
    /// Edit tools plus a vetted command list. The default.
    #[serde(rename = "careful")]
    Careful,
    /// No restrictions.
    #[serde(rename = "full")]
    Full,
    /// Full access inside an isolated worktree.
    #[serde(rename = "shard")]
    Shard,
    /// Careful restrictions inside an isolated worktree.
    #[serde(rename = "careful+shard")]
    CarefulShard,
}

/// Allowed-tools list for the careful profile (claude CLI syntax).
const CAREFUL_TOOLS: &str = "Read,Write,Edit,Grep,Glob,Bash(git:*),Bash(make:*),\
Bash(cargo:*),Bash(pytest:*),Bash(python:*),Bash(npm:*)";

/// Allowed-tools list for the readonly profile (claude CLI syntax).
const READONLY_TOOLS: &str = "Read,Grep,Glob,Bash(ls:*),Bash(cat:*),Bash(head:*),\
Bash(tail:*),Bash(git status:*),Bash(git log:*),Bash(git diff:*)";

impl Permission {
    /// Parse a profile name. Unknown names are rejected at admission.
    pub fn parse(name: &str) -> Result<Self, String> {
        match name {
            "readonly" => Ok(Self::Readonly),
            "careful" => Ok(Self::Careful),
            "full" => Ok(Self::Full),
            "shard" => Ok(Self::Shard),
            "careful+shard" => Ok(Self::CarefulShard),
            other => Err(other.to_string()),
        }
    }

    /// The allowed-tools restriction for this profile, if any.
    #[must_use]
    pub const fn allowed_tools(self) -> Option<&'static str> {
        match self {
            Self::Readonly => Some(READONLY_TOOLS),
            Self::Careful | Self::CarefulShard => Some(CAREFUL_TOOLS),
            Self::Full | Self::Shard => None,
        }
    }

    /// Whether this profile auto-enables worktree isolation.
    #[must_use]
    pub const fn wants_shard(self) -> bool {
        matches!(self, Self::Shard | Self::CarefulShard)
    }

    /// Whether this profile runs the child without approval prompts.
    #[must_use]
    pub const fn bypasses_approvals(self) -> bool {
        matches!(self, Self::Full | Self::Shard | Self::CarefulShard)
    }
}

impl Default for Permission {
    fn default() -> Self {
        Self::Careful
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Readonly => "readonly",
            Self::Careful => "careful",
            Self::Full => "full",
            Self::Shard => "shard",
            Self::CarefulShard => "careful+shard",
        };
        write!(f, "{s}")
    }
}

/// Filesystem sandbox policy derived for harnesses that support one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxPolicy {
    /// Read-only filesystem view.
    ReadOnly,
    /// Writes confined to the working directory.
    WorkspaceWrite,
    /// Unrestricted filesystem access.
    DangerFullAccess,
    /// Host cannot enforce a sandbox; restrictions bypassed and recorded.
    Bypass,
}

impl std::fmt::Display for SandboxPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ReadOnly => "read-only",
            Self::WorkspaceWrite => "workspace-write",
            Self::DangerFullAccess => "danger-full-access",
            Self::Bypass => "bypass",
        };
        write!(f, "{s}")
    }
}

/// Isolated-workspace record attached to a spool that ran in a shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    /// Absolute path of the worktree the child ran in.
    pub worktree_path: PathBuf,
    /// Branch the worktree was cut onto.
    pub branch_name: String,
    /// Short identifier, also the worktree directory name.
    pub shard_id: String,
    /// Set once the branch has been merged back.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub merged: bool,
    /// Set once the worktree has been abandoned.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub abandoned: bool,
}

/// The durable record of one delegated task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spool {
    /// Unique identifier within the store. Codex spools carry a `codex-`
    /// prefix.
    pub id: String,

    /// Which harness runs this task.
    pub harness: Harness,

    /// Lifecycle state.
    pub status: SpoolStatus,

    /// Task text, verbatim.
    pub prompt: String,

    /// Optional extra system instructions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Directory the child runs in.
    pub working_dir: PathBuf,

    /// Tool restriction string passed to the harness, derived from
    /// `permission` unless given explicitly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<String>,

    /// Permission profile in effect.
    pub permission: Permission,

    /// Harness-specific model tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Derived sandbox policy (codex only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxPolicy>,

    /// Ordered labels for grouping spools.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// OS pid of the detached child while running; zero once reaped.
    #[serde(default)]
    pub pid: u32,

    /// Continuation token emitted by the harness on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Isolated-workspace record, present when the child ran in a shard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<ShardInfo>,

    /// Output sink the child's stdout is redirected to.
    pub stdout_path: PathBuf,

    /// Output sink the child's stderr is redirected to.
    pub stderr_path: PathBuf,

    /// Final textual output; present iff `status` is `complete`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    /// Terminal failure message; present iff `status` is `error`,
    /// `timeout`, or `killed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Record creation instant.
    pub created_at: DateTime<Local>,

    /// Instant the child was spawned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Local>>,

    /// Instant the spool reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Local>>,

    /// Kill deadline in seconds, measured from `started_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    /// Ancestor spool id when this spool continues or retries another.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<String>,

    /// Cancellation requested; the monitor finalizes as `killed`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancel_requested: bool,

    /// The session resumer fell back to transcript injection.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub transcript_fallback: bool,
}

impl Spool {
    /// Seconds elapsed since the child was spawned, if it was.
    #[must_use]
    pub fn running_secs(&self, now: DateTime<Local>) -> Option<i64> {
        self.started_at.map(|t| (now - t).num_seconds())
    }

    /// Whether the timeout deadline has elapsed.
    #[must_use]
    pub fn deadline_exceeded(&self, now: DateTime<Local>) -> bool {
        match (self.timeout_seconds, self.running_secs(now)) {
            (Some(limit), Some(elapsed)) => elapsed >= 0 && elapsed as u64 >= limit,
            _ => false,
        }
    }

    /// Finalize into a terminal state, clearing the pid and stamping
    /// `completed_at`. Exactly one of `result`/`error` must be supplied,
    /// matching the status.
    pub(crate) fn finalize(
        &mut self,
        status: SpoolStatus,
        result: Option<String>,
        error: Option<String>,
    ) {
        debug_assert!(status.is_terminal());
        debug_assert!(result.is_some() != error.is_some());
        self.status = status;
        self.result = result;
        self.error = error;
        self.pid = 0;
        self.completed_at = Some(Local::now());
    }
}
