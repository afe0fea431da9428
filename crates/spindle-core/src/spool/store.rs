//! Durable spool store: one JSON document per spool.
//!
//! The filesystem is the database. Every write goes through a temp file in
//! the same directory followed by a rename, so a crash leaves either the
//! old complete record or the new complete record, never a partial write.
//! Records that fail to parse are quarantined with a `.bad` suffix and
//! excluded from listings.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use super::{Spool, SpoolStatus};

/// Errors from spool store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No record with the given id.
    #[error("unknown spool_id '{0}'")]
    NotFound(String),

    /// Record exists but could not be parsed; it has been quarantined.
    #[error("corrupt spool record '{0}' (quarantined)")]
    Corrupt(String),

    /// Serialization failure.
    #[error("failed to encode spool record: {0}")]
    Encode(#[from] serde_json::Error),

    /// I/O error.
    #[error("spool store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// On-disk store of spool records and their output artifacts.
#[derive(Debug, Clone)]
pub struct SpoolStore {
    dir: PathBuf,
}

impl SpoolStore {
    /// Open a store rooted at the given spools directory, creating it (and
    /// the transcripts subdirectory) if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(dir.join("transcripts"))?;
        Ok(Self { dir })
    }

    /// The spools directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a spool's JSON record.
    #[must_use]
    pub fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Path of a spool's stdout sink.
    #[must_use]
    pub fn stdout_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.stdout"))
    }

    /// Path of a spool's stderr sink.
    #[must_use]
    pub fn stderr_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.stderr"))
    }

    /// Path of a spool's saved transcript.
    #[must_use]
    pub fn transcript_path(&self, id: &str) -> PathBuf {
        self.dir.join("transcripts").join(format!("{id}.txt"))
    }

    /// Persist a record atomically (temp file + rename).
    pub fn put(&self, spool: &Spool) -> Result<(), StoreError> {
        let path = self.record_path(&spool.id);
        let data = serde_json::to_vec_pretty(spool)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&data)?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }

    /// Load a record by id.
    pub fn get(&self, id: &str) -> Result<Spool, StoreError> {
        let path = self.record_path(id);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&data) {
            Ok(spool) => Ok(spool),
            Err(e) => {
                self.quarantine(&path, &e);
                Err(StoreError::Corrupt(id.to_string()))
            }
        }
    }

    /// Read-modify-write a record. The mutator sees the freshly loaded
    /// record; the full record is written back, so concurrent updaters
    /// resolve last-writer-wins.
    pub fn update<F>(&self, id: &str, mutate: F) -> Result<Spool, StoreError>
    where
        F: FnOnce(&mut Spool),
    {
        let mut spool = self.get(id)?;
        mutate(&mut spool);
        self.put(&spool)?;
        Ok(spool)
    }

    /// List every parseable record. Corrupt files are quarantined and
    /// skipped.
    #[must_use]
    pub fn list(&self) -> Vec<Spool> {
        let mut spools = Vec::new();
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return spools;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path).map_err(StoreError::from).and_then(|data| {
                serde_json::from_slice::<Spool>(&data).map_err(StoreError::from)
            }) {
                Ok(spool) => spools.push(spool),
                Err(e) => self.quarantine(&path, &e),
            }
        }
        spools
    }

    /// List records matching a predicate.
    #[must_use]
    pub fn list_where<F>(&self, predicate: F) -> Vec<Spool>
    where
        F: Fn(&Spool) -> bool,
    {
        self.list().into_iter().filter(|s| predicate(s)).collect()
    }

    /// Number of records currently `running`.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.list_where(|s| s.status == SpoolStatus::Running).len()
    }

    /// Most recent spool whose `session_id` matches, if any.
    #[must_use]
    pub fn find_by_session(&self, session_id: &str) -> Option<Spool> {
        self.list_where(|s| s.session_id.as_deref() == Some(session_id))
            .into_iter()
            .max_by_key(|s| s.created_at)
    }

    /// Remove terminal records created before the cutoff, along with their
    /// artifacts and transcripts. Active records are never swept.
    pub fn sweep(&self, before: DateTime<Local>) -> usize {
        let mut removed = 0;
        for spool in self.list() {
            if spool.status.is_active() || spool.created_at >= before {
                continue;
            }
            let _ = fs::remove_file(self.record_path(&spool.id));
            self.remove_artifacts(&spool.id);
            let _ = fs::remove_file(self.transcript_path(&spool.id));
            removed += 1;
        }
        if removed > 0 {
            tracing::debug!(removed, "swept expired spool records");
        }
        removed
    }

    /// Delete a spool's output sinks.
    pub fn remove_artifacts(&self, id: &str) {
        let _ = fs::remove_file(self.stdout_path(id));
        let _ = fs::remove_file(self.stderr_path(id));
    }

    fn quarantine(&self, path: &Path, cause: &dyn std::fmt::Display) {
        let bad = path.with_extension("json.bad");
        tracing::warn!(path = %path.display(), %cause, "quarantining corrupt spool record");
        let _ = fs::rename(path, bad);
    }
}
