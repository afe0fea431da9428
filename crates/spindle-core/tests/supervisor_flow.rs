//! End-to-end supervisor scenarios against a stub `claude` binary.
//!
//! The stub honors the small command contract the adapter relies on:
//! `-p sleep:<secs>` sleeps before answering, `--resume <sid>` fails with
//! the expired-session signature, anything else answers immediately with a
//! claude-style JSON object.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use spindle_core::config::SpindleConfig;
use spindle_core::monitor::Monitor;
use spindle_core::spool::SpoolStatus;
use spindle_core::supervisor::{SpinRequest, Supervisor, SupervisorError};
use spindle_core::wait::WaitMode;

const STUB: &str = r#"#!/bin/sh
prompt=""
resume=""
prev=""
for arg in "$@"; do
  case "$prev" in
    -p) prompt="$arg" ;;
    --resume) resume="$arg" ;;
  esac
  prev="$arg"
done
if [ -n "$resume" ]; then
  echo "No conversation found with session ID $resume" >&2
  exit 1
fi
case "$prompt" in
  sleep:*) sleep "${prompt#sleep:}" ;;
esac
head=$(printf '%s' "$prompt" | head -n1 | cut -c1-40 | tr -d '"\\')
printf '{"result": "stub handled: %s", "session_id": "stub-%s"}\n' "$head" "$$"
"#;

/// Install the stub binary once and prepend it to PATH for every test in
/// this process.
fn install_stub() {
    static INSTALLED: OnceLock<PathBuf> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let bin = std::env::temp_dir().join(format!("spindle-stub-{}", std::process::id()));
        std::fs::create_dir_all(&bin).unwrap();
        let path = bin.join("claude");
        std::fs::write(&path, STUB).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let old = std::env::var("PATH").unwrap_or_default();
        std::env::set_var("PATH", format!("{}:{old}", bin.display()));
        bin
    });
}

fn fixture(max_concurrent: usize) -> (tempfile::TempDir, Supervisor) {
    install_stub();
    let dir = tempfile::tempdir().unwrap();
    let mut config = SpindleConfig::with_root(dir.path());
    config.max_concurrent = max_concurrent;
    config.poll_interval = Duration::from_millis(100);
    (dir, Supervisor::new(config).unwrap())
}

fn spin_request(prompt: &str, dir: &tempfile::TempDir) -> SpinRequest {
    SpinRequest {
        prompt: prompt.to_string(),
        working_dir: Some(dir.path().to_path_buf()),
        ..SpinRequest::default()
    }
}

async fn tick_until<F>(monitor: &Arc<Monitor>, mut done: F, limit: Duration)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while !done() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within {limit:?}"
        );
        monitor.tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn spawn_ticker(monitor: Arc<Monitor>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            monitor.tick().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
}

#[tokio::test]
async fn fire_and_forget_completes_within_a_tick() {
    let (dir, supervisor) = fixture(15);
    let spool_id = supervisor.spin(spin_request("echo hello", &dir)).unwrap();

    let running = supervisor.unspool(&spool_id).unwrap();
    assert_eq!(running.status, SpoolStatus::Running);
    assert!(running.pid > 0);
    assert!(supervisor
        .store()
        .record_path(&spool_id)
        .exists());

    let monitor = supervisor.monitor();
    tick_until(
        &monitor,
        || supervisor.unspool(&spool_id).unwrap().status.is_terminal(),
        Duration::from_secs(10),
    )
    .await;

    let done = supervisor.unspool(&spool_id).unwrap();
    assert_eq!(done.status, SpoolStatus::Complete);
    assert!(done.result.as_deref().unwrap().contains("stub handled"));
    assert!(done.session_id.is_some());
    assert_eq!(done.pid, 0);
    assert!(done.completed_at.unwrap() >= done.started_at.unwrap());
}

#[tokio::test]
async fn capacity_limit_rejects_and_creates_nothing() {
    let (dir, supervisor) = fixture(2);
    supervisor.spin(spin_request("sleep:5", &dir)).unwrap();
    supervisor.spin(spin_request("sleep:5", &dir)).unwrap();

    let before = supervisor.store().list().len();
    let err = supervisor.spin(spin_request("sleep:5", &dir)).unwrap_err();
    assert!(matches!(err, SupervisorError::AtCapacity(_)));
    assert!(err.to_string().contains("at-capacity"));
    assert_eq!(supervisor.store().list().len(), before);
}

#[tokio::test]
async fn timeout_finalizes_promptly() {
    let (dir, supervisor) = fixture(15);
    let mut request = spin_request("sleep:30", &dir);
    request.timeout = Some(1);
    let spool_id = supervisor.spin(request).unwrap();

    let monitor = supervisor.monitor();
    tick_until(
        &monitor,
        || supervisor.unspool(&spool_id).unwrap().status.is_terminal(),
        Duration::from_secs(5),
    )
    .await;

    let done = supervisor.unspool(&spool_id).unwrap();
    assert_eq!(done.status, SpoolStatus::Timeout);
    assert_eq!(done.pid, 0);
    assert!(done.error.as_deref().unwrap().contains("timeout"));
}

#[tokio::test]
async fn gather_wait_returns_insertion_order() {
    let (dir, supervisor) = fixture(15);
    let ids: Vec<String> = ["sleep:0.1", "sleep:0.2", "sleep:0.3"]
        .iter()
        .map(|p| supervisor.spin(spin_request(p, &dir)).unwrap())
        .collect();

    let ticker = spawn_ticker(supervisor.monitor());
    let report = supervisor
        .spin_wait(&ids, WaitMode::Gather, Some(Duration::from_secs(10)))
        .await
        .unwrap();
    ticker.abort();

    assert!(report.pending.is_empty());
    let order: Vec<&str> = report.records.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(order, ids.iter().map(String::as_str).collect::<Vec<_>>());
    assert!(report
        .records
        .iter()
        .all(|s| s.status == SpoolStatus::Complete));
}

#[tokio::test]
async fn stream_wait_yields_in_completion_order() {
    let (dir, supervisor) = fixture(15);
    let slow = supervisor.spin(spin_request("sleep:1.6", &dir)).unwrap();
    let fast = supervisor.spin(spin_request("sleep:0.1", &dir)).unwrap();
    let mid = supervisor.spin(spin_request("sleep:0.8", &dir)).unwrap();

    let ticker = spawn_ticker(supervisor.monitor());
    let ids = vec![slow.clone(), fast.clone(), mid.clone()];
    let report = supervisor
        .spin_wait(&ids, WaitMode::Stream, Some(Duration::from_secs(15)))
        .await
        .unwrap();
    ticker.abort();

    let order: Vec<&str> = report.records.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(order, vec![fast.as_str(), mid.as_str(), slow.as_str()]);
}

#[tokio::test]
async fn drop_kills_a_running_spool() {
    let (dir, supervisor) = fixture(15);
    let spool_id = supervisor.spin(spin_request("sleep:30", &dir)).unwrap();
    supervisor.spin_drop(&spool_id).unwrap();

    let monitor = supervisor.monitor();
    tick_until(
        &monitor,
        || supervisor.unspool(&spool_id).unwrap().status.is_terminal(),
        Duration::from_secs(5),
    )
    .await;

    let done = supervisor.unspool(&spool_id).unwrap();
    assert_eq!(done.status, SpoolStatus::Killed);
    assert!(done.error.is_some());
    assert!(done.result.is_none());
}

#[tokio::test]
async fn expired_session_falls_back_to_transcript_injection() {
    let (dir, supervisor) = fixture(15);

    // Run an original task to completion so a transcript exists.
    let original = supervisor.spin(spin_request("seed context", &dir)).unwrap();
    let monitor = supervisor.monitor();
    tick_until(
        &monitor,
        || supervisor.unspool(&original).unwrap().status.is_terminal(),
        Duration::from_secs(10),
    )
    .await;
    let session_id = supervisor
        .unspool(&original)
        .unwrap()
        .session_id
        .expect("original spool has a session");
    assert!(supervisor.store().transcript_path(&original).exists());

    // The stub fails any --resume attempt with the expired signature, so
    // the monitor must respawn via transcript injection.
    let continuation = supervisor.respin(&session_id, "ok").unwrap();
    tick_until(
        &monitor,
        || {
            supervisor
                .unspool(&continuation)
                .unwrap()
                .status
                .is_terminal()
        },
        Duration::from_secs(10),
    )
    .await;

    let done = supervisor.unspool(&continuation).unwrap();
    assert_eq!(done.status, SpoolStatus::Complete);
    assert_eq!(done.retry_of.as_deref(), Some(original.as_str()));
    assert!(done.transcript_fallback);
    assert!(done.result.is_some());
}

#[tokio::test]
async fn orphan_recovery_finalizes_stale_running_records() {
    let (dir, supervisor) = fixture(15);
    let spool_id = supervisor.spin(spin_request("sleep:30", &dir)).unwrap();
    let pid = supervisor.unspool(&spool_id).unwrap().pid;

    // Simulate a restart: a fresh supervisor over the same root has no
    // child handles; the old child is killed so its pid is gone.
    supervisor.spin_drop(&spool_id).unwrap();
    let monitor = supervisor.monitor();
    tick_until(
        &monitor,
        || supervisor.unspool(&spool_id).unwrap().status.is_terminal(),
        Duration::from_secs(5),
    )
    .await;
    supervisor
        .store()
        .update(&spool_id, |s| {
            s.status = SpoolStatus::Running;
            s.result = None;
            s.error = None;
            s.completed_at = None;
            s.pid = pid;
        })
        .unwrap();

    let restarted = Supervisor::new(SpindleConfig {
        poll_interval: Duration::from_millis(100),
        ..SpindleConfig::with_root(dir.path())
    })
    .unwrap();
    restarted.recover_orphans();

    let recovered = restarted.unspool(&spool_id).unwrap();
    assert_eq!(recovered.status, SpoolStatus::Error);
    assert_eq!(recovered.error.as_deref(), Some("orphaned"));
}

#[tokio::test]
async fn retry_links_back_to_the_original() {
    let (dir, supervisor) = fixture(15);
    let original = supervisor.spin(spin_request("first attempt", &dir)).unwrap();
    let monitor = supervisor.monitor();
    tick_until(
        &monitor,
        || supervisor.unspool(&original).unwrap().status.is_terminal(),
        Duration::from_secs(10),
    )
    .await;

    let retried = supervisor.spool_retry(&original).unwrap();
    assert_ne!(retried, original);
    let record = supervisor.unspool(&retried).unwrap();
    assert_eq!(record.retry_of.as_deref(), Some(original.as_str()));
    assert_eq!(record.prompt, "first attempt");
}
