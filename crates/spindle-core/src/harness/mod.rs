//! Harness adapters.
//!
//! A harness is a pluggable adapter over one child-agent CLI. Adapters own
//! everything CLI-specific: command construction, permission/sandbox
//! mapping, output parsing, continuation, and the stderr fingerprints that
//! identify an expired session. The rest of the supervisor dispatches by
//! the `harness` tag on the spool and treats children as opaque processes.

pub mod claude;
pub mod codex;

use serde::{Deserialize, Serialize};

use crate::spool::{Permission, SandboxPolicy, Spool};

/// Discriminant naming the child-agent CLI a spool runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Harness {
    /// The `claude` CLI.
    Claude,
    /// The `codex` CLI.
    Codex,
}

impl Harness {
    /// Parse a harness tag. Unknown tags are rejected at admission.
    pub fn parse(name: &str) -> Result<Self, HarnessError> {
        match name {
            "claude" => Ok(Self::Claude),
            "codex" => Ok(Self::Codex),
            other => Err(HarnessError::Unknown(other.to_string())),
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::Claude
    }
}

impl std::fmt::Display for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Claude => write!(f, "claude"),
            Self::Codex => write!(f, "codex"),
        }
    }
}

/// Terminal outcome extracted from a child's stdout artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedOutput {
    /// Final textual output.
    pub result: String,
    /// Continuation token, when the harness emitted one.
    pub session_id: Option<String>,
}

/// Errors from harness adapters.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Harness tag not recognized.
    #[error("unknown harness '{0}'")]
    Unknown(String),

    /// The child produced no usable output.
    #[error("no usable output from {harness} child")]
    UnusableOutput {
        /// Harness the child ran on.
        harness: Harness,
    },
}

/// Per-harness capability set.
///
/// `build_command` and `resume_command` return full argv vectors (binary
/// first); the launcher handles detachment, redirection, and cwd.
pub trait HarnessAdapter: Send + Sync {
    /// The tag this adapter serves.
    fn harness(&self) -> Harness;

    /// Visible id discriminator, prepended to generated spool ids.
    fn id_prefix(&self) -> Option<&'static str> {
        None
    }

    /// Whether admission must reject a spawn without a working directory.
    fn requires_working_dir(&self) -> bool {
        true
    }

    /// Sandbox policy recorded for a profile, for harnesses with
    /// filesystem sandboxing.
    fn sandbox_policy(&self, _permission: Permission) -> Option<SandboxPolicy> {
        None
    }

    /// Translate a spool record into the CLI invocation.
    fn build_command(&self, spool: &Spool) -> Vec<String>;

    /// Extract the terminal outcome from the stdout artifact.
    fn parse_output(&self, stdout: &str) -> Result<ParsedOutput, HarnessError>;

    /// Whether the artifact already holds a complete result. Some CLIs
    /// keep the process alive after writing their final output; the
    /// monitor finalizes from the artifact in that case.
    fn output_complete(&self, _stdout: &str) -> bool {
        false
    }

    /// CLI invocation continuing an existing session.
    fn resume_command(&self, session_id: &str, prompt: &str) -> Vec<String>;

    /// CLI invocation reconstructing context by transcript injection, for
    /// harnesses that support it.
    fn fallback_resume(&self, _transcript: &str, _prompt: &str) -> Option<Vec<String>> {
        None
    }

    /// Whether the stderr content carries this harness's expired-session
    /// signature.
    fn session_expired(&self, _stderr: &str) -> bool {
        false
    }
}

/// The set of available adapters, dispatched by harness tag.
pub struct HarnessRegistry {
    claude: claude::ClaudeHarness,
    codex: codex::CodexHarness,
}

impl HarnessRegistry {
    /// Build the registry, probing host capabilities (codex sandbox
    /// support) once.
    #[must_use]
    pub fn detect() -> Self {
        Self {
            claude: claude::ClaudeHarness,
            codex: codex::CodexHarness::detect(),
        }
    }

    /// Registry with a fixed codex sandbox capability, for tests.
    #[must_use]
    pub fn with_codex_sandbox(supported: bool) -> Self {
        Self {
            claude: claude::ClaudeHarness,
            codex: codex::CodexHarness::new(supported),
        }
    }

    /// The adapter for a harness tag.
    #[must_use]
    pub fn adapter(&self, harness: Harness) -> &dyn HarnessAdapter {
        match harness {
            Harness::Claude => &self.claude,
            Harness::Codex => &self.codex,
        }
    }
}

impl std::fmt::Debug for HarnessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarnessRegistry").finish_non_exhaustive()
    }
}
