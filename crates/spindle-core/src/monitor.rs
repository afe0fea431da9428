//! Monitor loop: the single background worker that finalizes spools.
//!
//! Every tick the monitor inspects each `running` record: cancellation
//! flags first, then timeout deadlines, then expired-session probes for
//! continuation spools, then liveness. A dead child (or a complete output
//! artifact from a CLI that lingers after writing it) finalizes the spool.
//! Failures while processing one spool are logged and never stall the
//! loop.
//!
//! The monitor is the only code that observes children; request handlers
//! just read and write the store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;

use crate::config::SpindleConfig;
use crate::harness::HarnessRegistry;
use crate::launcher::{pid_alive, pid_cmdline, ChildState, Launcher};
use crate::resume;
use crate::shard::ShardManager;
use crate::spool::store::{SpoolStore, StoreError};
use crate::spool::{Spool, SpoolStatus};

/// Interval between retention sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Running spools older than this are flagged on the dashboard.
const ATTENTION_RUNNING_SECS: i64 = 30 * 60;

/// Cap on the stderr tail captured into a spool's `error` field.
const STDERR_TAIL_CHARS: usize = 500;

/// The background reaper.
#[derive(Debug)]
pub struct Monitor {
    store: SpoolStore,
    launcher: Arc<Launcher>,
    harnesses: Arc<HarnessRegistry>,
    shards: Arc<ShardManager>,
    config: SpindleConfig,
}

impl Monitor {
    /// Build a monitor over the shared supervisor state.
    #[must_use]
    pub fn new(
        store: SpoolStore,
        launcher: Arc<Launcher>,
        harnesses: Arc<HarnessRegistry>,
        shards: Arc<ShardManager>,
        config: SpindleConfig,
    ) -> Self {
        Self {
            store,
            launcher,
            harnesses,
            shards,
            config,
        }
    }

    /// Run forever at the configured cadence. Sweeps expired records at
    /// startup and then hourly.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_sweep = None::<tokio::time::Instant>;

        loop {
            interval.tick().await;

            let due = last_sweep.map_or(true, |t| t.elapsed() >= SWEEP_INTERVAL);
            if due {
                let horizon = chrono::Duration::from_std(self.config.retention)
                    .unwrap_or_else(|_| chrono::Duration::hours(24));
                self.store.sweep(Local::now() - horizon);
                last_sweep = Some(tokio::time::Instant::now());
            }

            self.tick().await;
        }
    }

    /// One pass over every running spool.
    pub async fn tick(&self) {
        for spool in self.store.list_where(|s| s.status == SpoolStatus::Running) {
            let id = spool.id.clone();
            if let Err(e) = self.process(spool).await {
                tracing::warn!(spool_id = %id, error = %e, "monitor pass failed for spool");
            }
        }
    }

    async fn process(&self, spool: Spool) -> Result<(), StoreError> {
        if spool.cancel_requested {
            self.launcher
                .terminate(spool.pid, self.config.kill_grace)
                .await;
            self.reap(&spool.id, spool.pid).await;
            self.store.update(&spool.id, |s| {
                s.finalize(SpoolStatus::Killed, None, Some("cancelled".to_string()));
            })?;
            tracing::info!(spool_id = %spool.id, "spool killed on request");
            return Ok(());
        }

        if spool.deadline_exceeded(Local::now()) {
            self.launcher
                .terminate(spool.pid, self.config.kill_grace)
                .await;
            self.reap(&spool.id, spool.pid).await;
            let limit = spool.timeout_seconds.unwrap_or(0);
            self.store.update(&spool.id, |s| {
                s.finalize(
                    SpoolStatus::Timeout,
                    None,
                    Some(format!("timeout after {limit}s")),
                );
            })?;
            tracing::info!(spool_id = %spool.id, limit, "spool timed out");
            return Ok(());
        }

        // Continuation spools watch stderr for the harness's expired-session
        // signature and fall back to transcript injection.
        if spool.session_id.is_some() && spool.retry_of.is_some() && !spool.transcript_fallback {
            let stderr = std::fs::read_to_string(&spool.stderr_path).unwrap_or_default();
            let adapter = self.harnesses.adapter(spool.harness);
            if adapter.session_expired(&stderr) {
                match resume::fallback_respawn(&self.store, &self.launcher, adapter, &spool).await {
                    Ok(true) => return Ok(()),
                    Ok(false) => {
                        self.store.update(&spool.id, |s| {
                            s.finalize(
                                SpoolStatus::Error,
                                None,
                                Some("session expired and no transcript available".to_string()),
                            );
                        })?;
                        return Ok(());
                    }
                    Err(e) => {
                        tracing::warn!(spool_id = %spool.id, error = %e, "transcript fallback failed");
                    }
                }
            }
        }

        match self.launcher.probe(&spool.id, spool.pid) {
            ChildState::Alive => {
                // Some CLIs keep the process alive after writing the final
                // result; finalize from the artifact once it is complete.
                let stdout = std::fs::read_to_string(&spool.stdout_path).unwrap_or_default();
                if self
                    .harnesses
                    .adapter(spool.harness)
                    .output_complete(&stdout)
                {
                    self.finalize_from_artifacts(&spool, None)?;
                }
                Ok(())
            }
            ChildState::Exited(code) => {
                self.finalize_from_artifacts(&spool, code)?;
                Ok(())
            }
        }
    }

    fn finalize_from_artifacts(&self, spool: &Spool, exit_code: Option<i32>) -> Result<(), StoreError> {
        let stdout = std::fs::read_to_string(&spool.stdout_path).unwrap_or_default();
        let adapter = self.harnesses.adapter(spool.harness);

        match adapter.parse_output(&stdout) {
            Ok(parsed) => {
                if let Some(session_id) = &parsed.session_id {
                    self.save_transcript(&spool.id, session_id, &stdout);
                }
                self.store.update(&spool.id, |s| {
                    s.session_id = parsed.session_id.clone();
                    s.finalize(SpoolStatus::Complete, Some(parsed.result.clone()), None);
                })?;
                self.store.remove_artifacts(&spool.id);
                tracing::info!(spool_id = %spool.id, "spool complete");
            }
            Err(_) => {
                let stderr = std::fs::read_to_string(&spool.stderr_path).unwrap_or_default();
                let message = if stderr.trim().is_empty() {
                    match exit_code {
                        Some(code) => format!("process exited with code {code} and no output"),
                        None => "process exited with no output".to_string(),
                    }
                } else {
                    tail_chars(&stderr, STDERR_TAIL_CHARS)
                };
                self.store.update(&spool.id, |s| {
                    s.finalize(SpoolStatus::Error, None, Some(message.clone()));
                })?;
                tracing::warn!(spool_id = %spool.id, "spool failed");
            }
        }
        Ok(())
    }

    /// Reap a just-terminated child so its pid leaves the process table.
    async fn reap(&self, spool_id: &str, pid: u32) {
        for _ in 0..10 {
            if matches!(self.launcher.probe(spool_id, pid), ChildState::Exited(_)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.launcher.forget(spool_id);
    }

    fn save_transcript(&self, spool_id: &str, session_id: &str, stdout: &str) {
        let path = self.store.transcript_path(spool_id);
        if let Err(e) = std::fs::write(&path, stdout) {
            tracing::warn!(spool_id, session_id, error = %e, "failed to save transcript");
        }
    }

    /// Finalize records left `running` (or `pending`) by a previous
    /// supervisor whose children are gone, or whose pids now belong to a
    /// different process image. Run once at startup, before the loop.
    pub fn recover_orphans(&self) {
        for spool in self.store.list_where(|s| s.status.is_active()) {
            let orphaned = if spool.pid == 0 {
                true
            } else if !pid_alive(spool.pid) {
                true
            } else {
                // Alive pid recycled by an unrelated process counts as
                // orphaned too; the child's image must mention the harness
                // binary.
                match pid_cmdline(spool.pid) {
                    Some(cmdline) => !cmdline.contains(&spool.harness.to_string()),
                    None => false,
                }
            };
            if !orphaned {
                continue;
            }
            let result = self.store.update(&spool.id, |s| {
                s.finalize(SpoolStatus::Error, None, Some("orphaned".to_string()));
            });
            match result {
                Ok(_) => tracing::warn!(spool_id = %spool.id, "recovered orphaned spool"),
                Err(e) => tracing::warn!(spool_id = %spool.id, error = %e, "orphan recovery failed"),
            }
        }
    }

    /// Last `lines` lines of a running spool's stdout artifact, with a
    /// status header. Does not block or disturb the child.
    pub fn peek(&self, spool_id: &str, lines: usize) -> Result<String, StoreError> {
        let spool = self.store.get(spool_id)?;
        let Ok(content) = std::fs::read_to_string(&spool.stdout_path) else {
            return Ok(format!("no output yet for spool {spool_id}"));
        };
        if content.is_empty() {
            return Ok(format!("output file exists but is empty for spool {spool_id}"));
        }
        let all: Vec<&str> = content.lines().collect();
        let shown = all.len().min(lines);
        let tail = &all[all.len() - shown..];
        Ok(format!(
            "[spool {spool_id} - {} - {} total lines, showing last {shown}]\n{}",
            spool.status,
            all.len(),
            tail.join("\n")
        ))
    }

    /// Summarized store state: counts, the running set, recent
    /// completions, and spools needing attention.
    #[must_use]
    pub fn dashboard(&self) -> Dashboard {
        let now = Local::now();
        let hour_ago = now - chrono::Duration::hours(1);
        let all = self.store.list();

        let mut running = Vec::new();
        let mut recent: Vec<(chrono::DateTime<Local>, DashboardEntry)> = Vec::new();
        let mut attention = Vec::new();
        let mut errors = 0usize;
        let mut complete_last_hour = 0usize;

        for spool in &all {
            match spool.status {
                SpoolStatus::Running => {
                    running.push(DashboardEntry {
                        spool_id: spool.id.clone(),
                        task: truncate(&spool.prompt, 60),
                        status: spool.status.to_string(),
                        detail: spool.started_at.map(|t| t.to_rfc3339()),
                    });
                    if spool.running_secs(now).is_some_and(|s| s > ATTENTION_RUNNING_SECS) {
                        attention.push(DashboardEntry {
                            spool_id: spool.id.clone(),
                            task: truncate(&spool.prompt, 60),
                            status: spool.status.to_string(),
                            detail: Some("running longer than expected".to_string()),
                        });
                    }
                }
                SpoolStatus::Error | SpoolStatus::Timeout | SpoolStatus::Killed => {
                    errors += 1;
                    if spool.completed_at.is_some_and(|t| t >= hour_ago) {
                        attention.push(DashboardEntry {
                            spool_id: spool.id.clone(),
                            task: truncate(&spool.prompt, 60),
                            status: spool.status.to_string(),
                            detail: spool.error.as_deref().map(|e| truncate(e, 80)),
                        });
                    }
                }
                SpoolStatus::Complete => {
                    if let Some(completed_at) = spool.completed_at.filter(|t| *t >= hour_ago) {
                        complete_last_hour += 1;
                        recent.push((
                            completed_at,
                            DashboardEntry {
                                spool_id: spool.id.clone(),
                                task: truncate(&spool.prompt, 60),
                                status: spool.status.to_string(),
                                detail: Some(format!(
                                    "{}m ago",
                                    (now - completed_at).num_minutes()
                                )),
                            },
                        ));
                    }
                    if let Some(shard) = &spool.shard {
                        if !shard.merged && !shard.abandoned {
                            if let Ok(status) = self.shards.status(shard) {
                                let reason = if status.worktree_exists && !status.clean {
                                    Some("shard has uncommitted changes")
                                } else if status.worktree_exists && status.ahead_by > 0 {
                                    Some("shard has unmerged commits")
                                } else {
                                    None
                                };
                                if let Some(reason) = reason {
                                    attention.push(DashboardEntry {
                                        spool_id: spool.id.clone(),
                                        task: truncate(&spool.prompt, 60),
                                        status: spool.status.to_string(),
                                        detail: Some(reason.to_string()),
                                    });
                                }
                            }
                        }
                    }
                }
                SpoolStatus::Pending => {}
            }
        }

        recent.sort_by(|a, b| b.0.cmp(&a.0));
        let recent: Vec<DashboardEntry> = recent.into_iter().take(10).map(|(_, e)| e).collect();

        Dashboard {
            summary: DashboardSummary {
                running: running.len(),
                complete_last_hour,
                errors,
                total_spools: all.len(),
            },
            running,
            recent_completions: recent,
            needing_attention: attention,
        }
    }
}

/// Counts shown at the top of the dashboard.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DashboardSummary {
    /// Spools currently running.
    pub running: usize,
    /// Spools completed within the last hour.
    pub complete_last_hour: usize,
    /// Spools in a failure state.
    pub errors: usize,
    /// Every record in the store.
    pub total_spools: usize,
}

/// One row of the dashboard.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DashboardEntry {
    /// Spool id.
    pub spool_id: String,
    /// Truncated prompt.
    pub task: String,
    /// Status string.
    pub status: String,
    /// Context: start time, age, or the attention reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Single-view status summary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Dashboard {
    /// Counts by disposition.
    pub summary: DashboardSummary,
    /// Currently running spools.
    pub running: Vec<DashboardEntry>,
    /// Completions in the last hour, newest first.
    pub recent_completions: Vec<DashboardEntry>,
    /// Spools a supervisor operator should look at.
    pub needing_attention: Vec<DashboardEntry>,
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let head: String = text.chars().take(max).collect();
        format!("{head}...")
    }
}

fn tail_chars(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        text.to_string()
    } else {
        text.chars().skip(count - max).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::harness::Harness;
    use crate::spool::Permission;

    fn fixture() -> (tempfile::TempDir, Arc<Monitor>, SpoolStore) {
        let dir = tempfile::tempdir().unwrap();
        let config = SpindleConfig::with_root(dir.path());
        let store = SpoolStore::open(config.spools_dir()).unwrap();
        let monitor = Arc::new(Monitor::new(
            store.clone(),
            Arc::new(Launcher::new()),
            Arc::new(HarnessRegistry::with_codex_sandbox(true)),
            Arc::new(ShardManager::new()),
            config,
        ));
        (dir, monitor, store)
    }

    fn running_spool(store: &SpoolStore, id: &str, pid: u32) -> Spool {
        Spool {
            id: id.to_string(),
            harness: Harness::Claude,
            status: SpoolStatus::Running,
            prompt: "task".to_string(),
            system_prompt: None,
            working_dir: PathBuf::from("/tmp"),
            allowed_tools: None,
            permission: Permission::Careful,
            model: None,
            sandbox: None,
            tags: Vec::new(),
            pid,
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
        }
    }

    /// A pid far above any real pid space, so liveness probes see it dead.
    const DEAD_PID: u32 = 0x3fff_fff0;

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn dead_child_with_parseable_output_completes() {
        let (_dir, monitor, store) = fixture();
        let spool = running_spool(&store, "m1", DEAD_PID);
        std::fs::write(
            &spool.stdout_path,
            r#"{"result": "all done", "session_id": "sess-m1"}"#,
        )
        .unwrap();
        store.put(&spool).unwrap();

        monitor.tick().await;

        let done = store.get("m1").unwrap();
        assert_eq!(done.status, SpoolStatus::Complete);
        assert_eq!(done.result.as_deref(), Some("all done"));
        assert_eq!(done.session_id.as_deref(), Some("sess-m1"));
        assert_eq!(done.pid, 0);
        assert!(done.completed_at.is_some());
        // Artifacts were removed, transcript saved.
        assert!(!store.stdout_path("m1").exists());
        assert!(store.transcript_path("m1").exists());
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn dead_child_without_output_errors_with_stderr_tail() {
        let (_dir, monitor, store) = fixture();
        let spool = running_spool(&store, "m2", DEAD_PID);
        std::fs::write(&spool.stderr_path, "boom: something failed\n").unwrap();
        store.put(&spool).unwrap();

        monitor.tick().await;

        let done = store.get("m2").unwrap();
        assert_eq!(done.status, SpoolStatus::Error);
        assert!(done.error.as_deref().unwrap().contains("boom"));
        assert!(done.result.is_none());
        // Failure artifacts are preserved for inspection.
        assert!(store.stderr_path("m2").exists());
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn timeout_is_enforced_within_a_tick() {
        let (_dir, monitor, store) = fixture();
        let mut spool = running_spool(&store, "m3", DEAD_PID);
        spool.timeout_seconds = Some(1);
        spool.started_at = Some(Local::now() - chrono::Duration::seconds(5));
        store.put(&spool).unwrap();

        monitor.tick().await;

        let done = store.get("m3").unwrap();
        assert_eq!(done.status, SpoolStatus::Timeout);
        assert_eq!(done.pid, 0);
        assert!(done.error.as_deref().unwrap().contains("timeout"));
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn cancel_flag_finalizes_as_killed() {
        let (_dir, monitor, store) = fixture();
        let mut spool = running_spool(&store, "m4", DEAD_PID);
        spool.cancel_requested = true;
        store.put(&spool).unwrap();

        monitor.tick().await;

        let done = store.get("m4").unwrap();
        assert_eq!(done.status, SpoolStatus::Killed);
        assert!(done.error.is_some());
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn complete_artifact_finalizes_while_child_lingers() {
        let (_dir, monitor, store) = fixture();
        // Our own pid is definitely alive and not a claude process, but the
        // artifact already holds a complete JSON result.
        let spool = running_spool(&store, "m5", std::process::id());
        std::fs::write(&spool.stdout_path, r#"{"result": "early"}"#).unwrap();
        store.put(&spool).unwrap();

        monitor.tick().await;

        let done = store.get("m5").unwrap();
        assert_eq!(done.status, SpoolStatus::Complete);
        assert_eq!(done.result.as_deref(), Some("early"));
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn one_bad_record_does_not_stall_the_tick() {
        let (_dir, monitor, store) = fixture();
        let good = running_spool(&store, "m6", DEAD_PID);
        std::fs::write(&good.stdout_path, r#"{"result": "fine"}"#).unwrap();
        store.put(&good).unwrap();
        std::fs::write(store.record_path("zz-corrupt"), b"{ nope").unwrap();

        monitor.tick().await;

        assert_eq!(store.get("m6").unwrap().status, SpoolStatus::Complete);
    }

    #[test]
    fn orphan_recovery_marks_dead_pids() {
        let (_dir, monitor, store) = fixture();
        store.put(&running_spool(&store, "o1", DEAD_PID)).unwrap();
        let mut pending = running_spool(&store, "o2", 0);
        pending.status = SpoolStatus::Pending;
        store.put(&pending).unwrap();
        let mut done = running_spool(&store, "o3", DEAD_PID);
        done.finalize(SpoolStatus::Complete, Some("kept".to_string()), None);
        store.put(&done).unwrap();

        monitor.recover_orphans();

        for id in ["o1", "o2"] {
            let spool = store.get(id).unwrap();
            assert_eq!(spool.status, SpoolStatus::Error);
            assert_eq!(spool.error.as_deref(), Some("orphaned"));
        }
        // Terminal records are untouched.
        assert_eq!(store.get("o3").unwrap().status, SpoolStatus::Complete);
    }

    #[test]
    fn orphan_recovery_detects_recycled_pids() {
        let (_dir, monitor, store) = fixture();
        // Our own pid is alive but its image is this test binary, not the
        // claude CLI.
        store
            .put(&running_spool(&store, "o4", std::process::id()))
            .unwrap();

        monitor.recover_orphans();

        if pid_cmdline(std::process::id()).is_some() {
            let spool = store.get("o4").unwrap();
            assert_eq!(spool.status, SpoolStatus::Error);
            assert_eq!(spool.error.as_deref(), Some("orphaned"));
        }
    }

    #[test]
    fn peek_returns_tail_with_header() {
        let (_dir, monitor, store) = fixture();
        let spool = running_spool(&store, "p1", DEAD_PID);
        std::fs::write(&spool.stdout_path, "one\ntwo\nthree\nfour\n").unwrap();
        store.put(&spool).unwrap();

        let peeked = monitor.peek("p1", 2).unwrap();
        assert!(peeked.starts_with("[spool p1 - running - 4 total lines, showing last 2]"));
        assert!(peeked.ends_with("three\nfour"));

        assert!(monitor.peek("missing", 2).is_err());
    }

    #[test]
    fn dashboard_counts_and_flags() {
        let (_dir, monitor, store) = fixture();
        store.put(&running_spool(&store, "d1", DEAD_PID)).unwrap();

        let mut failed = running_spool(&store, "d2", DEAD_PID);
        failed.finalize(SpoolStatus::Error, None, Some("exploded".to_string()));
        store.put(&failed).unwrap();

        let mut ok = running_spool(&store, "d3", DEAD_PID);
        ok.finalize(SpoolStatus::Complete, Some("done".to_string()), None);
        store.put(&ok).unwrap();

        let dashboard = monitor.dashboard();
        assert_eq!(dashboard.summary.running, 1);
        assert_eq!(dashboard.summary.errors, 1);
        assert_eq!(dashboard.summary.complete_last_hour, 1);
        assert_eq!(dashboard.summary.total_spools, 3);
        assert!(dashboard
            .needing_attention
            .iter()
            .any(|e| e.spool_id == "d2"));
    }
}
