//! Shard manager: isolated version-controlled workspaces.
//!
//! A shard is a git worktree under `<working_dir>/worktrees/`, cut onto a
//! fresh branch from whatever the caller's repository has checked out. A
//! child running in a shard can edit and commit freely without touching
//! the main checkout; afterwards the branch is merged back with an
//! explicit merge commit or the worktree is abandoned.
//!
//! git invocations are serialized per repository root so concurrent shard
//! operations cannot corrupt the index.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use crate::spool::id;
use crate::spool::ShardInfo;

/// Errors from shard operations.
#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    /// Worktree creation failed; admission is aborted.
    #[error("failed to allocate shard worktree: {0}")]
    Allocate(String),

    /// The worktree no longer exists on disk.
    #[error("worktree no longer exists: {0}")]
    MissingWorktree(PathBuf),

    /// The worktree has uncommitted changes.
    #[error("shard has uncommitted changes; commit or discard them first")]
    DirtyWorktree,

    /// A git invocation failed outright.
    #[error("git {op} failed: {detail}")]
    Git {
        /// The git operation.
        op: &'static str,
        /// Captured stderr.
        detail: String,
    },

    /// git itself could not be run.
    #[error("failed to run git: {0}")]
    Io(#[from] std::io::Error),
}

/// Point-in-time view of a shard's repository state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ShardStatus {
    /// The shard's branch.
    pub branch: String,
    /// Whether the worktree is still on disk.
    pub worktree_exists: bool,
    /// No uncommitted changes in the worktree.
    pub clean: bool,
    /// Commits on the shard branch not on the base branch.
    pub ahead_by: u32,
    /// Commits on the base branch not on the shard branch.
    pub behind_by: u32,
}

/// Result of merging a shard back.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MergeOutcome {
    /// Commits brought over by the merge.
    pub merged_commits: u32,
    /// Conflict description when the merge could not complete.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicts: Option<String>,
}

/// Manages shard worktree lifecycle.
#[derive(Debug, Default)]
pub struct ShardManager {
    repo_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl ShardManager {
    /// Create a manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a worktree for a spool under `<working_dir>/worktrees/`,
    /// cut onto branch `shard-<spool_id>-<short>`.
    pub fn allocate(&self, spool_id: &str, working_dir: &Path) -> Result<ShardInfo, ShardError> {
        let lock = self.repo_lock(working_dir);
        let _guard = lock.lock().expect("repo lock poisoned");

        let worktrees_dir = working_dir.join("worktrees");
        std::fs::create_dir_all(&worktrees_dir)?;

        let shard_id = format!("{spool_id}-{}", id::short_suffix());
        let worktree_path = worktrees_dir.join(&shard_id);
        let branch_name = format!("shard-{shard_id}");

        let output = git(
            working_dir,
            &[
                "worktree",
                "add",
                worktree_path.to_string_lossy().as_ref(),
                "-b",
                &branch_name,
            ],
        )?;
        if !output.ok {
            return Err(ShardError::Allocate(output.stderr));
        }

        tracing::info!(spool_id, %shard_id, worktree = %worktree_path.display(), "allocated shard");
        Ok(ShardInfo {
            worktree_path,
            branch_name,
            shard_id,
            merged: false,
            abandoned: false,
        })
    }

    /// Repository state of a shard: branch, cleanliness, ahead/behind the
    /// base branch.
    pub fn status(&self, shard: &ShardInfo) -> Result<ShardStatus, ShardError> {
        if !shard.worktree_path.exists() {
            return Ok(ShardStatus {
                branch: shard.branch_name.clone(),
                worktree_exists: false,
                clean: true,
                ahead_by: 0,
                behind_by: 0,
            });
        }

        let main_repo = main_repo_of(shard);
        let lock = self.repo_lock(&main_repo);
        let _guard = lock.lock().expect("repo lock poisoned");

        let clean = worktree_clean(&shard.worktree_path)?;
        let base = current_branch(&main_repo)?;

        let range = format!("{base}...{}", shard.branch_name);
        let counts = git(&main_repo, &["rev-list", "--left-right", "--count", &range])?;
        let (behind_by, ahead_by) = if counts.ok {
            parse_left_right(&counts.stdout)
        } else {
            (0, 0)
        };

        Ok(ShardStatus {
            branch: shard.branch_name.clone(),
            worktree_exists: true,
            clean,
            ahead_by,
            behind_by,
        })
    }

    /// Merge the shard branch into the base branch with an explicit merge
    /// commit, then remove the worktree. On conflict the merge is aborted
    /// and the conflict description returned; nothing is cleaned up.
    pub fn merge(
        &self,
        shard: &ShardInfo,
        subject: &str,
        keep_branch: bool,
    ) -> Result<MergeOutcome, ShardError> {
        if !shard.worktree_path.exists() {
            return Err(ShardError::MissingWorktree(shard.worktree_path.clone()));
        }

        let main_repo = main_repo_of(shard);
        let lock = self.repo_lock(&main_repo);
        let _guard = lock.lock().expect("repo lock poisoned");

        if !worktree_clean(&shard.worktree_path)? {
            return Err(ShardError::DirtyWorktree);
        }

        let base = current_branch(&main_repo)?;
        let range = format!("{base}..{}", shard.branch_name);
        let counts = git(&main_repo, &["rev-list", "--count", &range])?;
        let merged_commits: u32 = counts.stdout.trim().parse().unwrap_or(0);

        let message = format!("Merge shard {}: {subject}", shard.shard_id);
        let merge = git(
            &main_repo,
            &["merge", &shard.branch_name, "--no-ff", "-m", &message],
        )?;
        if !merge.ok {
            let _ = git(&main_repo, &["merge", "--abort"]);
            let description = if merge.stdout.trim().is_empty() {
                merge.stderr
            } else {
                merge.stdout
            };
            return Ok(MergeOutcome {
                merged_commits: 0,
                conflicts: Some(description.trim().to_string()),
            });
        }

        self.remove_worktree(&main_repo, shard, keep_branch);
        tracing::info!(shard_id = %shard.shard_id, merged_commits, "merged shard");
        Ok(MergeOutcome {
            merged_commits,
            conflicts: None,
        })
    }

    /// Remove the worktree without merging; optionally keep the branch.
    pub fn abandon(&self, shard: &ShardInfo, keep_branch: bool) -> Result<(), ShardError> {
        let main_repo = main_repo_of(shard);
        let lock = self.repo_lock(&main_repo);
        let _guard = lock.lock().expect("repo lock poisoned");
        self.remove_worktree(&main_repo, shard, keep_branch);
        tracing::info!(shard_id = %shard.shard_id, keep_branch, "abandoned shard");
        Ok(())
    }

    fn remove_worktree(&self, main_repo: &Path, shard: &ShardInfo, keep_branch: bool) {
        let _ = git(
            main_repo,
            &[
                "worktree",
                "remove",
                "--force",
                shard.worktree_path.to_string_lossy().as_ref(),
            ],
        );
        if !keep_branch {
            let _ = git(main_repo, &["branch", "-D", &shard.branch_name]);
        }
        let _ = git(main_repo, &["worktree", "prune"]);
    }

    fn repo_lock(&self, repo: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.repo_locks.lock().expect("shard lock map poisoned");
        locks
            .entry(repo.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// The main repository a shard's worktree belongs to
/// (`<repo>/worktrees/<shard_id>` -> `<repo>`).
#[must_use]
pub fn main_repo_of(shard: &ShardInfo) -> PathBuf {
    shard
        .worktree_path
        .parent()
        .and_then(Path::parent)
        .map_or_else(|| shard.worktree_path.clone(), Path::to_path_buf)
}

struct GitOutput {
    ok: bool,
    stdout: String,
    stderr: String,
}

fn git(cwd: &Path, args: &[&str]) -> Result<GitOutput, ShardError> {
    let output = Command::new("git").args(args).current_dir(cwd).output()?;
    Ok(GitOutput {
        ok: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

fn worktree_clean(worktree: &Path) -> Result<bool, ShardError> {
    let output = git(worktree, &["status", "--porcelain"])?;
    if !output.ok {
        return Err(ShardError::Git {
            op: "status",
            detail: output.stderr,
        });
    }
    Ok(output.stdout.trim().is_empty())
}

fn current_branch(repo: &Path) -> Result<String, ShardError> {
    let output = git(repo, &["rev-parse", "--abbrev-ref", "HEAD"])?;
    if !output.ok {
        return Err(ShardError::Git {
            op: "rev-parse",
            detail: output.stderr,
        });
    }
    Ok(output.stdout.trim().to_string())
}

fn parse_left_right(stdout: &str) -> (u32, u32) {
    let mut parts = stdout.split_whitespace();
    let left = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let right = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (left, right)
}
