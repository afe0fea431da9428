//! Supervisor configuration.
//!
//! All knobs have working defaults; the two environment variables
//! `SPINDLE_DIR` and `SPINDLE_MAX_CONCURRENT` override the persistence
//! root and the global concurrency ceiling.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default global ceiling on concurrently running spools.
pub const DEFAULT_MAX_CONCURRENT: usize = 15;

/// Default cadence of the monitor loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default retention horizon for terminal spool records.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Grace window between SIGTERM and SIGKILL when terminating a child.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(500);

/// Supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpindleConfig {
    /// Persistence root. Spool records live under `<root>/spools/`.
    pub root: PathBuf,

    /// Global ceiling on concurrently running spools.
    pub max_concurrent: usize,

    /// Monitor loop cadence.
    pub poll_interval: Duration,

    /// Retention horizon for terminal records.
    pub retention: Duration,

    /// Grace window between graceful and forced termination.
    pub kill_grace: Duration,
}

impl SpindleConfig {
    /// Build a configuration from the environment, falling back to
    /// defaults (`~/.spindle`, ceiling 15).
    #[must_use]
    pub fn from_env() -> Self {
        let root = std::env::var_os("SPINDLE_DIR").map_or_else(default_root, PathBuf::from);

        let max_concurrent = std::env::var("SPINDLE_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_CONCURRENT);

        Self {
            root,
            max_concurrent,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retention: DEFAULT_RETENTION,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    /// Configuration rooted at an explicit directory. Used by tests and by
    /// callers that manage their own state location.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retention: DEFAULT_RETENTION,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    /// Directory holding spool records and output artifacts.
    #[must_use]
    pub fn spools_dir(&self) -> PathBuf {
        self.root.join("spools")
    }

    /// Path of the mtime-based reload marker.
    #[must_use]
    pub fn reload_signal_path(&self) -> PathBuf {
        self.root.join("reload_signal")
    }
}

fn default_root() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".spindle")
}
