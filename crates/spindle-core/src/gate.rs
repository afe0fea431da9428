//! Concurrency gate: the global ceiling on running spools.
//!
//! Admission recomputes the running census from the on-disk store rather
//! than trusting an in-memory counter, so the ceiling stays correct across
//! supervisor restarts. The guard is held for the whole admission path
//! (census, record creation, spawn), which makes admission totally ordered
//! within one supervisor process. Release is implicit: once the monitor
//! moves a spool out of `running`, the next census sees the free slot.

use std::sync::{Mutex, MutexGuard};

use crate::spool::store::SpoolStore;

/// Admission failure.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// The running census is at the ceiling.
    #[error("at-capacity: {running}/{ceiling} spools running; wait for some to complete")]
    AtCapacity {
        /// Configured ceiling.
        ceiling: usize,
        /// Running spools observed.
        running: usize,
    },
}

/// Serializing admission gate.
#[derive(Debug)]
pub struct ConcurrencyGate {
    ceiling: usize,
    lock: Mutex<()>,
}

/// Held for the duration of one admission; dropping it reopens the gate.
#[derive(Debug)]
pub struct AdmissionGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl ConcurrencyGate {
    /// Gate with the given ceiling.
    #[must_use]
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            lock: Mutex::new(()),
        }
    }

    /// The configured ceiling.
    #[must_use]
    pub const fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Admit one spawn: serialize against other admissions and check the
    /// on-disk running census.
    pub fn admit<'a>(&'a self, store: &SpoolStore) -> Result<AdmissionGuard<'a>, GateError> {
        let guard = self.lock.lock().expect("gate lock poisoned");
        let running = store.running_count();
        if running >= self.ceiling {
            return Err(GateError::AtCapacity {
                ceiling: self.ceiling,
                running,
            });
        }
        Ok(AdmissionGuard { _guard: guard })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::Local;

    use super::*;
    use crate::harness::Harness;
    use crate::spool::{Permission, Spool, SpoolStatus};

    fn running_spool(store: &SpoolStore, id: &str) -> Spool {
        Spool {
            id: id.to_string(),
            harness: Harness::Claude,
            status: SpoolStatus::Running,
            prompt: "busy".to_string(),
            system_prompt: None,
            working_dir: PathBuf::from("/work"),
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
        }
    }

    #[test]
    fn admits_below_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let store = SpoolStore::open(dir.path()).unwrap();
        let gate = ConcurrencyGate::new(2);

        store.put(&running_spool(&store, "r1")).unwrap();
        assert!(gate.admit(&store).is_ok());
    }

    #[test]
    fn rejects_at_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let store = SpoolStore::open(dir.path()).unwrap();
        let gate = ConcurrencyGate::new(2);

        store.put(&running_spool(&store, "r1")).unwrap();
        store.put(&running_spool(&store, "r2")).unwrap();

        let err = gate.admit(&store).unwrap_err();
        assert!(matches!(
            err,
            GateError::AtCapacity {
                ceiling: 2,
                running: 2
            }
        ));
    }

    #[test]
    fn census_comes_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = SpoolStore::open(dir.path()).unwrap();
        let gate = ConcurrencyGate::new(1);

        store.put(&running_spool(&store, "r1")).unwrap();
        assert!(gate.admit(&store).is_err());

        // A terminal transition written by "another" process frees a slot.
        store
            .update("r1", |s| {
                s.finalize(SpoolStatus::Complete, Some("done".to_string()), None);
            })
            .unwrap();
        assert!(gate.admit(&store).is_ok());
    }
}
