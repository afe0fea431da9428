//! The spool supervisor.
//!
//! One `Supervisor` value owns the store, the concurrency gate, the
//! launcher, the harness registry, and the shard manager; tests
//! instantiate fresh ones over a temporary root. Request handlers return
//! after admission and persistence; completion is observed asynchronously
//! by the monitor task.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::config::SpindleConfig;
use crate::gate::{ConcurrencyGate, GateError};
use crate::harness::{Harness, HarnessError, HarnessRegistry};
use crate::launcher::{LaunchError, Launcher};
use crate::monitor::{Dashboard, Monitor};
use crate::resume::ResumeError;
use crate::shard::{self, MergeOutcome, ShardError, ShardManager, ShardStatus};
use crate::spool::store::{SpoolStore, StoreError};
use crate::spool::{id, Permission, ShardInfo, Spool, SpoolStatus};
use crate::wait::{self, WaitError, WaitMode, WaitReport};

/// Guidance prepended to the child prompt when it runs inside a shard.
const SHARD_PREAMBLE: &str = "You are working in an isolated worktree.\n\n\
After completing work:\n\
1. Commit: git add -A && git commit -m \"<what you did>\"\n\n\
Your task:\n";

/// Errors surfaced synchronously by supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Admission refused: the running census is at the ceiling.
    #[error(transparent)]
    AtCapacity(#[from] GateError),

    /// Admission refused: unrecognized permission profile.
    #[error("invalid permission '{0}' (expected readonly, careful, full, shard, careful+shard)")]
    InvalidPermission(String),

    /// Admission refused: the harness needs a working directory.
    #[error("working_dir required: pass the project directory the {0} child should run in")]
    MissingWorkingDir(Harness),

    /// Admission refused: unknown harness tag.
    #[error(transparent)]
    Harness(#[from] HarnessError),

    /// Store failure (including unknown spool ids).
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Shard operation failure.
    #[error(transparent)]
    Shard(#[from] ShardError),

    /// Launch failure that could not be recorded on a spool.
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// Wait coordinator failure.
    #[error(transparent)]
    Wait(#[from] WaitError),

    /// Resume failure.
    #[error(transparent)]
    Resume(#[from] ResumeError),

    /// The operation needs the spool to be out of `running`.
    #[error("spool {0} is still running; wait for completion or spin_drop it first")]
    SpoolRunning(String),

    /// Another running spool occupies the shard worktree.
    #[error("spool {0} is still running in this worktree; wait or spin_drop it first")]
    WorktreeBusy(String),

    /// The spool has no shard.
    #[error("spool {0} has no shard")]
    NoShard(String),

    /// Malformed request argument.
    #[error("{0}")]
    InvalidArgument(String),
}

/// Arguments of the `spin` operation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpinRequest {
    /// Task text for the child agent.
    pub prompt: String,
    /// Harness tag (`claude` is the default).
    #[serde(default)]
    pub harness: Option<String>,
    /// Permission profile name (`careful` is the default).
    #[serde(default)]
    pub permission: Option<String>,
    /// Force worktree isolation regardless of the profile.
    #[serde(default)]
    pub shard: bool,
    /// Extra system instructions.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Directory the child runs in.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Explicit tool restriction, overriding the profile table.
    #[serde(default)]
    pub allowed_tools: Option<String>,
    /// Comma-separated labels.
    #[serde(default)]
    pub tags: Option<String>,
    /// Harness-specific model tag.
    #[serde(default)]
    pub model: Option<String>,
    /// Kill deadline in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Ancestor spool id, set by retry/continuation paths.
    #[serde(default)]
    pub retry_of: Option<String>,
}

/// Compact listing entry for the `spools` operation.
#[derive(Debug, Clone, Serialize)]
pub struct SpoolSummary {
    /// Spool id.
    pub id: String,
    /// Harness tag.
    pub harness: Harness,
    /// Lifecycle state.
    pub status: SpoolStatus,
    /// Prompt, truncated to 100 characters.
    pub prompt: String,
    /// Creation instant.
    pub created_at: DateTime<Local>,
    /// Continuation token, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Labels.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Shard state report for the `shard_status` operation.
#[derive(Debug, Clone, Serialize)]
pub struct ShardStatusReport {
    /// Owning spool id.
    pub spool_id: String,
    /// Spool lifecycle state.
    pub spool_status: SpoolStatus,
    /// The shard record.
    pub shard: ShardInfo,
    /// Repository state.
    pub status: ShardStatus,
}

/// Aggregate counts for the `spool_stats` operation.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    /// Total records in the store.
    pub total: usize,
    /// Record counts keyed by status string.
    pub by_status: std::collections::BTreeMap<String, usize>,
    /// Oldest record creation time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest: Option<DateTime<Local>>,
    /// Newest record creation time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest: Option<DateTime<Local>>,
}

/// One `spool_search` hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchMatch {
    /// Spool id.
    pub id: String,
    /// Lifecycle state.
    pub status: SpoolStatus,
    /// Creation instant.
    pub created_at: DateTime<Local>,
    /// Context snippet around the prompt hit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_match: Option<String>,
    /// Context snippet around the result hit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_match: Option<String>,
}

/// One `spool_grep` hit.
#[derive(Debug, Clone, Serialize)]
pub struct GrepMatch {
    /// Spool id.
    pub id: String,
    /// Lifecycle state.
    pub status: SpoolStatus,
    /// Prompt, truncated to 80 characters.
    pub prompt: String,
    /// Unique matched fragments, capped at 10.
    pub matches: Vec<String>,
    /// Total match count.
    pub match_count: usize,
}

/// One `spool_results` entry.
#[derive(Debug, Clone, Serialize)]
pub struct ResultEntry {
    /// Spool id.
    pub id: String,
    /// Lifecycle state.
    pub status: SpoolStatus,
    /// Prompt, truncated to 100 characters.
    pub prompt: String,
    /// Result, truncated to 500 characters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Creation instant.
    pub created_at: DateTime<Local>,
    /// Continuation token, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Health snapshot served at `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Always `healthy` when the supervisor answers at all.
    pub status: &'static str,
    /// Seconds since the supervisor started.
    pub uptime_seconds: u64,
    /// Running spools right now.
    pub running_spools: usize,
    /// Configured ceiling.
    pub max_concurrent: usize,
}

/// The process-scoped supervisor.
#[derive(Debug)]
pub struct Supervisor {
    config: SpindleConfig,
    store: SpoolStore,
    gate: ConcurrencyGate,
    launcher: Arc<Launcher>,
    harnesses: Arc<HarnessRegistry>,
    shards: Arc<ShardManager>,
    monitor: Arc<Monitor>,
    started_at: Instant,
}

impl Supervisor {
    /// Build a supervisor over the configured root, probing host harness
    /// capabilities once.
    pub fn new(config: SpindleConfig) -> Result<Self, SupervisorError> {
        Self::with_harnesses(config, HarnessRegistry::detect())
    }

    /// Build a supervisor with an explicit harness registry (tests pin
    /// the codex sandbox capability this way).
    pub fn with_harnesses(
        config: SpindleConfig,
        harnesses: HarnessRegistry,
    ) -> Result<Self, SupervisorError> {
        let store = SpoolStore::open(config.spools_dir())?;
        let gate = ConcurrencyGate::new(config.max_concurrent);
        let launcher = Arc::new(Launcher::new());
        let harnesses = Arc::new(harnesses);
        let shards = Arc::new(ShardManager::new());
        let monitor = Arc::new(Monitor::new(
            store.clone(),
            Arc::clone(&launcher),
            Arc::clone(&harnesses),
            Arc::clone(&shards),
            config.clone(),
        ));
        Ok(Self {
            config,
            store,
            gate,
            launcher,
            harnesses,
            shards,
            monitor,
            started_at: Instant::now(),
        })
    }

    /// The configuration in effect.
    #[must_use]
    pub fn config(&self) -> &SpindleConfig {
        &self.config
    }

    /// The underlying store (read-side helpers and tests).
    #[must_use]
    pub fn store(&self) -> &SpoolStore {
        &self.store
    }

    /// The monitor, for callers that drive ticks themselves.
    #[must_use]
    pub fn monitor(&self) -> Arc<Monitor> {
        Arc::clone(&self.monitor)
    }

    /// Finalize spools orphaned by a previous supervisor process. Call
    /// once at startup, before serving requests.
    pub fn recover_orphans(&self) {
        self.monitor.recover_orphans();
    }

    /// Spawn the background monitor task.
    #[must_use]
    pub fn spawn_monitor(&self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(Arc::clone(&self.monitor).run())
    }

    /// Spawn a child agent. Returns the spool id immediately; the child
    /// completes in the background.
    ///
    /// Admission errors (capacity, bad arguments) return `Err` and create
    /// no record. Launch errors (missing binary, worktree allocation)
    /// create the record, finalize it as `error`, and still return the id.
    pub fn spin(&self, request: SpinRequest) -> Result<String, SupervisorError> {
        let harness = match &request.harness {
            Some(name) => Harness::parse(name)?,
            None => Harness::default(),
        };
        let adapter = self.harnesses.adapter(harness);

        let permission = match &request.permission {
            Some(name) => {
                Permission::parse(name).map_err(SupervisorError::InvalidPermission)?
            }
            None => Permission::default(),
        };

        let working_dir = match &request.working_dir {
            Some(dir) => dir.clone(),
            None if adapter.requires_working_dir() => {
                return Err(SupervisorError::MissingWorkingDir(harness));
            }
            None => PathBuf::from("."),
        };

        // Explicit allowed_tools overrides the profile table and disables
        // profile-driven shard isolation.
        let (allowed_tools, auto_shard) = match &request.allowed_tools {
            Some(tools) => (Some(tools.clone()), false),
            None => (
                permission.allowed_tools().map(String::from),
                permission.wants_shard(),
            ),
        };
        let use_shard = request.shard || auto_shard;

        // The guard spans census, record creation, and spawn: admission is
        // totally ordered and the ceiling holds across the whole path.
        let _admission = self.gate.admit(&self.store)?;

        let spool_id = id::generate(adapter.id_prefix());
        let mut spool = Spool {
            id: spool_id.clone(),
            harness,
            status: SpoolStatus::Pending,
            prompt: request.prompt.clone(),
            system_prompt: request.system_prompt.clone(),
            working_dir: working_dir.clone(),
            allowed_tools,
            permission,
            model: request.model.clone(),
            sandbox: adapter.sandbox_policy(permission),
            tags: request.tags.as_deref().map(id::parse_tags).unwrap_or_default(),
            pid: 0,
            session_id: None,
            shard: None,
            stdout_path: self.store.stdout_path(&spool_id),
            stderr_path: self.store.stderr_path(&spool_id),
            result: None,
            error: None,
            created_at: Local::now(),
            started_at: None,
            completed_at: None,
            timeout_seconds: request.timeout,
            retry_of: request.retry_of.clone(),
            cancel_requested: false,
            transcript_fallback: false,
        };
        self.store.put(&spool)?;

        if use_shard {
            match self.shards.allocate(&spool_id, &working_dir) {
                Ok(info) => {
                    spool.working_dir = info.worktree_path.clone();
                    spool.shard = Some(info);
                }
                Err(e) => {
                    return self.fail_launch(spool, format!("{e}"));
                }
            }
        }

        // The record keeps the prompt verbatim; shard children get commit
        // guidance prepended to the command line only.
        let mut effective = spool.clone();
        if spool.shard.is_some() {
            effective.prompt = format!("{SHARD_PREAMBLE}{}", spool.prompt);
        }
        let argv = adapter.build_command(&effective);

        match self.launcher.spawn_detached(
            &spool_id,
            &argv,
            &spool.working_dir,
            &spool.stdout_path,
            &spool.stderr_path,
        ) {
            Ok(pid) => {
                spool.pid = pid;
                spool.status = SpoolStatus::Running;
                spool.started_at = Some(Local::now());
                self.store.put(&spool)?;
                tracing::info!(%spool_id, %harness, pid, "spool running");
                Ok(spool_id)
            }
            Err(e) => self.fail_launch(spool, format!("{e}")),
        }
    }

    fn fail_launch(&self, mut spool: Spool, message: String) -> Result<String, SupervisorError> {
        tracing::warn!(spool_id = %spool.id, %message, "launch failed");
        let spool_id = spool.id.clone();
        spool.finalize(SpoolStatus::Error, None, Some(message));
        self.store.put(&spool)?;
        Ok(spool_id)
    }

    /// Full record of one spool.
    pub fn unspool(&self, spool_id: &str) -> Result<Spool, SupervisorError> {
        Ok(self.store.get(spool_id)?)
    }

    /// Summaries of every record, newest first.
    #[must_use]
    pub fn spools(&self) -> Vec<SpoolSummary> {
        let mut all = self.store.list();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all.into_iter()
            .map(|s| SpoolSummary {
                id: s.id,
                harness: s.harness,
                status: s.status,
                prompt: truncate(&s.prompt, 100),
                created_at: s.created_at,
                session_id: s.session_id,
                tags: s.tags,
            })
            .collect()
    }

    /// Wait for spools per the mode, bounded by `timeout`.
    pub async fn spin_wait(
        &self,
        spool_ids: &[String],
        mode: WaitMode,
        timeout: Option<Duration>,
    ) -> Result<WaitReport, SupervisorError> {
        Ok(wait::wait(
            &self.store,
            spool_ids,
            mode,
            timeout,
            self.config.poll_interval,
        )
        .await?)
    }

    /// Continue an earlier session with a follow-up prompt. The
    /// continuation is itself a fresh spool linked via `retry_of`; if the
    /// upstream session has expired the monitor falls back to transcript
    /// injection.
    pub fn respin(&self, session_id: &str, prompt: &str) -> Result<String, SupervisorError> {
        let original = self.store.find_by_session(session_id);
        let harness = original.as_ref().map_or(Harness::Claude, |s| s.harness);
        let adapter = self.harnesses.adapter(harness);

        let working_dir = original
            .as_ref()
            .map_or_else(|| PathBuf::from("."), |s| s.working_dir.clone());

        let _admission = self.gate.admit(&self.store)?;

        let spool_id = id::generate(adapter.id_prefix());
        let mut spool = Spool {
            id: spool_id.clone(),
            harness,
            status: SpoolStatus::Pending,
            prompt: prompt.to_string(),
            system_prompt: None,
            working_dir: working_dir.clone(),
            allowed_tools: None,
            permission: Permission::default(),
            model: None,
            sandbox: adapter.sandbox_policy(Permission::default()),
            tags: Vec::new(),
            pid: 0,
            session_id: Some(session_id.to_string()),
            shard: None,
            stdout_path: self.store.stdout_path(&spool_id),
            stderr_path: self.store.stderr_path(&spool_id),
            result: None,
            error: None,
            created_at: Local::now(),
            started_at: None,
            completed_at: None,
            timeout_seconds: None,
            retry_of: original.map(|s| s.id),
            cancel_requested: false,
            transcript_fallback: false,
        };
        self.store.put(&spool)?;

        let argv = adapter.resume_command(session_id, prompt);
        match self.launcher.spawn_detached(
            &spool_id,
            &argv,
            &working_dir,
            &spool.stdout_path,
            &spool.stderr_path,
        ) {
            Ok(pid) => {
                spool.pid = pid;
                spool.status = SpoolStatus::Running;
                spool.started_at = Some(Local::now());
                self.store.put(&spool)?;
                tracing::info!(%spool_id, session_id, "continuation running");
                Ok(spool_id)
            }
            Err(e) => self.fail_launch(spool, format!("{e}")),
        }
    }

    /// Request cancellation of a running spool. Asynchronous: the
    /// terminal `killed` state is visible after the next monitor tick.
    /// A no-op success on already-terminal spools.
    pub fn spin_drop(&self, spool_id: &str) -> Result<String, SupervisorError> {
        let spool = self.store.get(spool_id)?;
        if spool.status.is_terminal() {
            return Ok(format!(
                "spool {spool_id} already terminal ({})",
                spool.status
            ));
        }
        self.launcher.request_stop(spool.pid);
        self.store.update(spool_id, |s| {
            s.cancel_requested = true;
        })?;
        tracing::info!(spool_id, "cancellation requested");
        Ok(format!("dropping spool {spool_id}"))
    }

    /// Last `lines` lines of a spool's live stdout artifact.
    pub fn spool_peek(&self, spool_id: &str, lines: usize) -> Result<String, SupervisorError> {
        Ok(self.monitor.peek(spool_id, lines)?)
    }

    /// Re-run a spool with the same parameters. The new spool links back
    /// via `retry_of`.
    pub fn spool_retry(&self, spool_id: &str) -> Result<String, SupervisorError> {
        let spool = self.store.get(spool_id)?;

        // A shard spool's working_dir points into the (possibly removed)
        // worktree; retry from the main repository and re-isolate.
        let working_dir = match &spool.shard {
            Some(info) => shard::main_repo_of(info),
            None => spool.working_dir.clone(),
        };

        self.spin(SpinRequest {
            prompt: spool.prompt,
            harness: Some(spool.harness.to_string()),
            permission: Some(spool.permission.to_string()),
            shard: spool.shard.is_some(),
            system_prompt: spool.system_prompt,
            working_dir: Some(working_dir),
            allowed_tools: None,
            tags: (!spool.tags.is_empty()).then(|| spool.tags.join(",")),
            model: spool.model,
            timeout: spool.timeout_seconds,
            retry_of: Some(spool.id),
        })
    }

    /// Repository state of a spool's shard.
    pub fn shard_status(&self, spool_id: &str) -> Result<ShardStatusReport, SupervisorError> {
        let spool = self.store.get(spool_id)?;
        let info = spool
            .shard
            .clone()
            .ok_or_else(|| SupervisorError::NoShard(spool_id.to_string()))?;
        let status = self.shards.status(&info)?;
        Ok(ShardStatusReport {
            spool_id: spool.id,
            spool_status: spool.status,
            shard: info,
            status,
        })
    }

    /// Merge a shard's branch back into the base branch and clean up the
    /// worktree. Conflicts are reported without completing the merge.
    pub fn shard_merge(
        &self,
        spool_id: &str,
        keep_branch: bool,
    ) -> Result<MergeOutcome, SupervisorError> {
        let spool = self.store.get(spool_id)?;
        if spool.status == SpoolStatus::Running {
            return Err(SupervisorError::SpoolRunning(spool_id.to_string()));
        }
        let info = spool
            .shard
            .clone()
            .ok_or_else(|| SupervisorError::NoShard(spool_id.to_string()))?;

        self.ensure_worktree_free(spool_id, &info)?;

        let outcome = self
            .shards
            .merge(&info, &truncate(&spool.prompt, 50), keep_branch)?;
        if outcome.conflicts.is_none() {
            self.store.update(spool_id, |s| {
                if let Some(shard) = &mut s.shard {
                    shard.merged = true;
                }
            })?;
        }
        Ok(outcome)
    }

    /// Remove a shard worktree without merging. A running spool is killed
    /// first.
    pub fn shard_abandon(
        &self,
        spool_id: &str,
        keep_branch: bool,
    ) -> Result<String, SupervisorError> {
        let spool = self.store.get(spool_id)?;
        let info = spool
            .shard
            .clone()
            .ok_or_else(|| SupervisorError::NoShard(spool_id.to_string()))?;

        self.ensure_worktree_free(spool_id, &info)?;

        if spool.status == SpoolStatus::Running {
            self.launcher.request_stop(spool.pid);
            self.store.update(spool_id, |s| {
                s.finalize(SpoolStatus::Killed, None, Some("shard abandoned".to_string()));
            })?;
        }

        self.shards.abandon(&info, keep_branch)?;
        self.store.update(spool_id, |s| {
            if let Some(shard) = &mut s.shard {
                shard.abandoned = true;
            }
        })?;
        Ok(format!(
            "abandoned shard {spool_id}{}",
            if keep_branch { " (branch kept)" } else { "" }
        ))
    }

    fn ensure_worktree_free(
        &self,
        spool_id: &str,
        info: &ShardInfo,
    ) -> Result<(), SupervisorError> {
        let occupant = self.store.list_where(|s| {
            s.status == SpoolStatus::Running
                && s.id != spool_id
                && s.working_dir == info.worktree_path
        });
        match occupant.into_iter().next() {
            Some(other) => Err(SupervisorError::WorktreeBusy(other.id)),
            None => Ok(()),
        }
    }

    /// Status dashboard (counts, running set, recent completions,
    /// attention flags).
    #[must_use]
    pub fn dashboard(&self) -> Dashboard {
        self.monitor.dashboard()
    }

    /// Aggregate record counts.
    #[must_use]
    pub fn spool_stats(&self) -> StatsReport {
        let all = self.store.list();
        let mut by_status = std::collections::BTreeMap::new();
        for spool in &all {
            *by_status.entry(spool.status.to_string()).or_insert(0) += 1;
        }
        StatsReport {
            total: all.len(),
            by_status,
            oldest: all.iter().map(|s| s.created_at).min(),
            newest: all.iter().map(|s| s.created_at).max(),
        }
    }

    /// Full record plus transcript availability, for debugging.
    pub fn spool_info(&self, spool_id: &str) -> Result<serde_json::Value, SupervisorError> {
        let spool = self.store.get(spool_id)?;
        let mut value = serde_json::to_value(&spool).map_err(StoreError::from)?;

        let transcript_owner = spool.retry_of.as_deref().unwrap_or(&spool.id);
        let transcript_path = self.store.transcript_path(transcript_owner);
        if let Some(object) = value.as_object_mut() {
            object.insert(
                "transcript_available".to_string(),
                serde_json::Value::Bool(transcript_path.exists()),
            );
        }
        Ok(value)
    }

    /// Case-insensitive substring search over prompts and/or results.
    pub fn spool_search(
        &self,
        query: &str,
        field: &str,
    ) -> Result<Vec<SearchMatch>, SupervisorError> {
        if !matches!(field, "prompt" | "result" | "both") {
            return Err(SupervisorError::InvalidArgument(format!(
                "invalid field '{field}' (expected prompt, result, or both)"
            )));
        }
        let needle = query.to_lowercase();
        let mut matches = Vec::new();
        for spool in self.store.list() {
            let prompt_hit = matches!(field, "prompt" | "both")
                .then(|| snippet(&spool.prompt, &needle, 30))
                .flatten();
            let result_hit = matches!(field, "result" | "both")
                .then(|| spool.result.as_deref().and_then(|r| snippet(r, &needle, 50)))
                .flatten();
            if prompt_hit.is_some() || result_hit.is_some() {
                matches.push(SearchMatch {
                    id: spool.id,
                    status: spool.status,
                    created_at: spool.created_at,
                    prompt_match: prompt_hit,
                    result_match: result_hit,
                });
            }
        }
        Ok(matches)
    }

    /// Bulk fetch of results filtered by status and age.
    pub fn spool_results(
        &self,
        status: &str,
        since: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ResultEntry>, SupervisorError> {
        let cutoff = match since {
            None => None,
            Some(tag) => Some(Local::now() - since_window(tag)?),
        };

        let mut filtered: Vec<Spool> = self
            .store
            .list()
            .into_iter()
            .filter(|s| status == "all" || s.status.to_string() == status)
            .filter(|s| cutoff.map_or(true, |c| s.created_at >= c))
            .collect();
        filtered.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        filtered.truncate(limit);

        Ok(filtered
            .into_iter()
            .map(|s| ResultEntry {
                id: s.id,
                status: s.status,
                prompt: truncate(&s.prompt, 100),
                result: s.result.as_deref().map(|r| truncate(r, 500)),
                created_at: s.created_at,
                session_id: s.session_id,
            })
            .collect())
    }

    /// Regex search over spool results.
    pub fn spool_grep(&self, pattern: &str) -> Result<Vec<GrepMatch>, SupervisorError> {
        let regex = regex::RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| SupervisorError::InvalidArgument(format!("invalid regex: {e}")))?;

        let mut matches = Vec::new();
        for spool in self.store.list() {
            let Some(result) = &spool.result else {
                continue;
            };
            let found: Vec<&str> = regex.find_iter(result).map(|m| m.as_str()).collect();
            if found.is_empty() {
                continue;
            }
            let mut unique: Vec<String> = Vec::new();
            for fragment in &found {
                if !unique.iter().any(|u| u == fragment) {
                    unique.push((*fragment).to_string());
                }
                if unique.len() == 10 {
                    break;
                }
            }
            matches.push(GrepMatch {
                id: spool.id,
                status: spool.status,
                prompt: truncate(&spool.prompt, 80),
                matches: unique,
                match_count: found.len(),
            });
        }
        Ok(matches)
    }

    /// Export spool records to a JSON or Markdown file. `spool_ids` is a
    /// comma-separated list or `all`. Returns the output path and count.
    pub fn spool_export(
        &self,
        spool_ids: &str,
        format: &str,
        output_path: Option<PathBuf>,
    ) -> Result<(PathBuf, usize), SupervisorError> {
        let mut selected: Vec<Spool> = if spool_ids.trim().eq_ignore_ascii_case("all") {
            self.store.list()
        } else {
            let mut spools = Vec::new();
            for id in spool_ids.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                spools.push(self.store.get(id)?);
            }
            spools
        };
        selected.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let (content, ext) = match format {
            "json" => (
                serde_json::to_string_pretty(&selected).map_err(StoreError::from)?,
                "json",
            ),
            "md" => (render_markdown(&selected), "md"),
            other => {
                return Err(SupervisorError::InvalidArgument(format!(
                    "invalid format '{other}' (expected json or md)"
                )));
            }
        };

        let path =
            output_path.unwrap_or_else(|| self.config.root.join(format!("export.{ext}")));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::from)?;
        }
        std::fs::write(&path, content).map_err(StoreError::from)?;
        Ok((path, selected.len()))
    }

    /// Liveness snapshot.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "healthy",
            uptime_seconds: self.started_at.elapsed().as_secs(),
            running_spools: self.store.running_count(),
            max_concurrent: self.config.max_concurrent,
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let head: String = text.chars().take(max).collect();
        format!("{head}...")
    }
}

fn since_window(tag: &str) -> Result<chrono::Duration, SupervisorError> {
    match tag {
        "1h" => Ok(chrono::Duration::hours(1)),
        "6h" => Ok(chrono::Duration::hours(6)),
        "12h" => Ok(chrono::Duration::hours(12)),
        "1d" => Ok(chrono::Duration::days(1)),
        "7d" => Ok(chrono::Duration::days(7)),
        other => Err(SupervisorError::InvalidArgument(format!(
            "invalid since value '{other}' (expected 1h, 6h, 12h, 1d, 7d)"
        ))),
    }
}

fn snippet(haystack: &str, needle_lower: &str, context: usize) -> Option<String> {
    let lower = haystack.to_lowercase();
    let idx = lower.find(needle_lower)?;
    let start = idx.saturating_sub(context);
    let end = (idx + needle_lower.len() + context).min(haystack.len());
    // Clamp to char boundaries.
    let start = (0..=start).rev().find(|i| haystack.is_char_boundary(*i))?;
    let end = (end..=haystack.len()).find(|i| haystack.is_char_boundary(*i))?;
    Some(format!("...{}...", &haystack[start..end]))
}

fn render_markdown(spools: &[Spool]) -> String {
    let mut lines = vec![
        "# Spool Export".to_string(),
        String::new(),
        format!("Generated: {}", Local::now().to_rfc3339()),
        String::new(),
    ];
    for spool in spools {
        lines.push(format!("## {}", spool.id));
        lines.push(format!("**Status:** {}", spool.status));
        lines.push(format!("**Created:** {}", spool.created_at.to_rfc3339()));
        lines.push(String::new());
        lines.push("### Prompt".to_string());
        lines.push(format!("```\n{}\n```", spool.prompt));
        lines.push(String::new());
        lines.push("### Result".to_string());
        lines.push(format!("```\n{}\n```", spool.result.as_deref().unwrap_or("")));
        lines.push(String::new());
        lines.push("---".to_string());
        lines.push(String::new());
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, Supervisor) {
        let dir = tempfile::tempdir().unwrap();
        let config = SpindleConfig::with_root(dir.path());
        let supervisor =
            Supervisor::with_harnesses(config, HarnessRegistry::with_codex_sandbox(true)).unwrap();
        (dir, supervisor)
    }

    fn seed_terminal(supervisor: &Supervisor, id: &str, status: SpoolStatus, result: &str) {
        let store = supervisor.store();
        let mut spool = Spool {
            id: id.to_string(),
            harness: Harness::Claude,
            status: SpoolStatus::Running,
            prompt: format!("prompt for {id}"),
            system_prompt: None,
            working_dir: PathBuf::from("/tmp"),
            allowed_tools: None,
            permission: Permission::Careful,
            model: None,
            sandbox: None,
            tags: Vec::new(),
            pid: 1,
            session_id: None,
            shard: None,
            stdout_path: store.stdout_path(id),
            stderr_path: store.stderr_path(id),
            result: None,
            error: None,
            created_at: Local::now(),
            started_at: Some(Local::now()),
            completed_at: None,
            timeout_seconds: None,
            retry_of: None,
            cancel_requested: false,
            transcript_fallback: false,
        };
        if status == SpoolStatus::Complete {
            spool.finalize(status, Some(result.to_string()), None);
        } else if status.is_terminal() {
            spool.finalize(status, None, Some(result.to_string()));
        }
        store.put(&spool).unwrap();
    }

    #[test]
    fn unknown_harness_is_rejected_without_a_record() {
        let (_dir, supervisor) = fixture();
        let err = supervisor
            .spin(SpinRequest {
                prompt: "x".to_string(),
                harness: Some("gemini".to_string()),
                working_dir: Some(PathBuf::from("/tmp")),
                ..SpinRequest::default()
            })
            .unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Harness(HarnessError::Unknown(_))
        ));
        assert!(supervisor.store().list().is_empty());
    }

    #[test]
    fn invalid_permission_is_rejected_without_a_record() {
        let (_dir, supervisor) = fixture();
        let err = supervisor
            .spin(SpinRequest {
                prompt: "x".to_string(),
                permission: Some("yolo".to_string()),
                working_dir: Some(PathBuf::from("/tmp")),
                ..SpinRequest::default()
            })
            .unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidPermission(_)));
        assert!(supervisor.store().list().is_empty());
    }

    #[test]
    fn missing_working_dir_is_rejected() {
        let (_dir, supervisor) = fixture();
        let err = supervisor
            .spin(SpinRequest {
                prompt: "x".to_string(),
                ..SpinRequest::default()
            })
            .unwrap_err();
        assert!(matches!(err, SupervisorError::MissingWorkingDir(_)));
        assert!(supervisor.store().list().is_empty());
    }

    #[test]
    fn at_capacity_creates_no_record() {
        let (_dir, supervisor) = fixture();
        let store = supervisor.store();
        for id in 0..supervisor.config().max_concurrent {
            seed_running(store, &format!("busy{id}"));
        }
        let before = store.list().len();
        let err = supervisor
            .spin(SpinRequest {
                prompt: "one too many".to_string(),
                working_dir: Some(PathBuf::from("/tmp")),
                ..SpinRequest::default()
            })
            .unwrap_err();
        assert!(matches!(err, SupervisorError::AtCapacity(_)));
        assert_eq!(store.list().len(), before);
    }

    fn seed_running(store: &SpoolStore, id: &str) {
        let spool = Spool {
            id: id.to_string(),
            harness: Harness::Claude,
            status: SpoolStatus::Running,
            prompt: "busy".to_string(),
            system_prompt: None,
            working_dir: PathBuf::from("/tmp"),
            allowed_tools: None,
            permission: Permission::Careful,
            model: None,
            sandbox: None,
            tags: Vec::new(),
            pid: 1,
            session_id: None,
            shard: None,
            stdout_path: store.stdout_path(id),
            stderr_path: store.stderr_path(id),
            result: None,
            error: None,
            created_at: Local::now(),
            started_at: Some(Local::now()),
            completed_at: None,
            timeout_seconds: None,
            retry_of: None,
            cancel_requested: false,
            transcript_fallback: false,
        };
        store.put(&spool).unwrap();
    }

    #[test]
    fn spin_drop_is_noop_on_terminal_spools() {
        let (_dir, supervisor) = fixture();
        seed_terminal(&supervisor, "done1", SpoolStatus::Complete, "fine");
        let message = supervisor.spin_drop("done1").unwrap();
        assert!(message.contains("already terminal"));
        assert_eq!(
            supervisor.store().get("done1").unwrap().status,
            SpoolStatus::Complete
        );
    }

    #[test]
    fn spin_drop_flags_running_spools() {
        let (_dir, supervisor) = fixture();
        seed_running(supervisor.store(), "run1");
        supervisor.spin_drop("run1").unwrap();
        assert!(supervisor.store().get("run1").unwrap().cancel_requested);
    }

    #[test]
    fn spools_lists_newest_first_with_truncated_prompts() {
        let (_dir, supervisor) = fixture();
        seed_terminal(&supervisor, "a1", SpoolStatus::Complete, "r");
        seed_terminal(&supervisor, "a2", SpoolStatus::Error, "e");
        let summaries = supervisor.spools();
        assert_eq!(summaries.len(), 2);
        assert!(summaries[0].created_at >= summaries[1].created_at);
    }

    #[test]
    fn search_results_stats_and_grep() {
        let (_dir, supervisor) = fixture();
        seed_terminal(
            &supervisor,
            "s1",
            SpoolStatus::Complete,
            "found friction-12-ab in module",
        );
        seed_terminal(&supervisor, "s2", SpoolStatus::Error, "exploded");

        let hits = supervisor.spool_search("friction", "result").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "s1");
        assert!(hits[0].result_match.as_deref().unwrap().contains("friction"));

        assert!(supervisor.spool_search("x", "nope").is_err());

        let results = supervisor.spool_results("complete", None, 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "s1");
        assert!(supervisor.spool_results("complete", Some("2h"), 10).is_err());

        let stats = supervisor.spool_stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_status.get("complete"), Some(&1));
        assert_eq!(stats.by_status.get("error"), Some(&1));

        let greps = supervisor.spool_grep(r"friction-\d+-\w+").unwrap();
        assert_eq!(greps.len(), 1);
        assert_eq!(greps[0].matches, vec!["friction-12-ab"]);
        assert!(supervisor.spool_grep("[unclosed").is_err());
    }

    #[test]
    fn export_writes_json_and_markdown() {
        let (dir, supervisor) = fixture();
        seed_terminal(&supervisor, "e1", SpoolStatus::Complete, "exported result");

        let (json_path, count) = supervisor.spool_export("e1", "json", None).unwrap();
        assert_eq!(count, 1);
        let content = std::fs::read_to_string(&json_path).unwrap();
        assert!(content.contains("exported result"));

        let md_path = dir.path().join("out.md");
        let (path, _) = supervisor
            .spool_export("all", "md", Some(md_path.clone()))
            .unwrap();
        assert_eq!(path, md_path);
        assert!(std::fs::read_to_string(&md_path).unwrap().contains("## e1"));

        assert!(supervisor.spool_export("e1", "xml", None).is_err());
        assert!(supervisor.spool_export("ghost", "json", None).is_err());
    }

    #[test]
    fn spool_info_reports_transcript_availability() {
        let (_dir, supervisor) = fixture();
        seed_terminal(&supervisor, "i1", SpoolStatus::Complete, "r");
        std::fs::write(supervisor.store().transcript_path("i1"), "transcript").unwrap();

        let info = supervisor.spool_info("i1").unwrap();
        assert_eq!(info["transcript_available"], serde_json::Value::Bool(true));
        assert_eq!(info["status"], "complete");
    }

    #[test]
    fn shard_operations_require_a_shard() {
        let (_dir, supervisor) = fixture();
        seed_terminal(&supervisor, "ns1", SpoolStatus::Complete, "r");
        assert!(matches!(
            supervisor.shard_status("ns1"),
            Err(SupervisorError::NoShard(_))
        ));
        assert!(matches!(
            supervisor.shard_merge("ns1", false),
            Err(SupervisorError::NoShard(_))
        ));
    }

    #[test]
    fn shard_merge_refuses_running_spools() {
        let (_dir, supervisor) = fixture();
        seed_running(supervisor.store(), "sr1");
        supervisor
            .store()
            .update("sr1", |s| {
                s.shard = Some(ShardInfo {
                    worktree_path: PathBuf::from("/repo/worktrees/sr1-x"),
                    branch_name: "shard-sr1-x".to_string(),
                    shard_id: "sr1-x".to_string(),
                    merged: false,
                    abandoned: false,
                });
            })
            .unwrap();
        assert!(matches!(
            supervisor.shard_merge("sr1", false),
            Err(SupervisorError::SpoolRunning(_))
        ));
    }

    #[test]
    fn health_reflects_census_and_ceiling() {
        let (_dir, supervisor) = fixture();
        seed_running(supervisor.store(), "h1");
        let health = supervisor.health();
        assert_eq!(health.status, "healthy");
        assert_eq!(health.running_spools, 1);
        assert_eq!(health.max_concurrent, supervisor.config().max_concurrent);
    }
}
