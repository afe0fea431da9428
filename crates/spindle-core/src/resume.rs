//! Session continuation fallback.
//!
//! A continuation spool (`respin`) runs the harness's resume command
//! against an upstream session id. Sessions expire; when the monitor spots
//! the adapter's expired-session signature on stderr, this module replaces
//! the child with a transcript-injection respawn: the original exchange is
//! embedded into a fresh prompt so the follow-up keeps its context without
//! the upstream session.

use std::time::Duration;

use crate::harness::HarnessAdapter;
use crate::launcher::{LaunchError, Launcher};
use crate::spool::store::{SpoolStore, StoreError};
use crate::spool::Spool;

/// Errors from the fallback respawn path.
#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    /// Store failure while updating the continuation spool.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The replacement child could not be spawned.
    #[error(transparent)]
    Launch(#[from] LaunchError),
}

/// Replace an expired continuation child with a transcript-injection
/// respawn. Returns `Ok(false)` when no transcript exists or the harness
/// has no fallback; the caller then finalizes the spool as an error.
pub async fn fallback_respawn(
    store: &SpoolStore,
    launcher: &Launcher,
    adapter: &dyn HarnessAdapter,
    spool: &Spool,
) -> Result<bool, ResumeError> {
    let Some(original_id) = spool.retry_of.as_deref() else {
        return Ok(false);
    };

    let transcript_path = store.transcript_path(original_id);
    let Ok(transcript) = std::fs::read_to_string(&transcript_path) else {
        tracing::debug!(spool_id = %spool.id, original_id, "no transcript for fallback");
        return Ok(false);
    };

    let Some(argv) = adapter.fallback_resume(&transcript, &spool.prompt) else {
        return Ok(false);
    };

    // Take down the failing resume child before its replacement starts.
    launcher
        .terminate(spool.pid, Duration::from_millis(200))
        .await;
    launcher.forget(&spool.id);

    let pid = launcher.spawn_detached(
        &spool.id,
        &argv,
        &spool.working_dir,
        &spool.stdout_path,
        &spool.stderr_path,
    )?;

    store.update(&spool.id, |s| {
        s.pid = pid;
        s.started_at = Some(chrono::Local::now());
        s.transcript_fallback = true;
    })?;

    tracing::info!(
        spool_id = %spool.id,
        original_id,
        pid,
        "respawned continuation via transcript injection"
    );
    Ok(true)
}
