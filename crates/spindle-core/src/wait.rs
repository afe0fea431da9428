//! Wait coordinator: multi-spool completion waiting.
//!
//! Both modes are polling loops over the store with bounded backoff; no
//! child handles are held, so waiting works for spools started by a
//! previous supervisor process. The waiter's deadline never cancels the
//! spools it watches.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::spool::store::{SpoolStore, StoreError};
use crate::spool::Spool;

/// Initial poll delay; doubles up to the cap.
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Completion-waiting mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WaitMode {
    /// Block until every spool is terminal (or the deadline), then return
    /// one record per id in input order.
    #[default]
    Gather,
    /// Collect terminal spools in completion order, same-tick ties broken
    /// by ascending id.
    Stream,
}

impl WaitMode {
    /// Parse a mode name.
    pub fn parse(name: &str) -> Result<Self, WaitError> {
        match name {
            "gather" => Ok(Self::Gather),
            "stream" => Ok(Self::Stream),
            other => Err(WaitError::UnknownMode(other.to_string())),
        }
    }
}

/// Errors from the wait coordinator.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// A requested spool id does not exist.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Unrecognized wait mode.
    #[error("unknown wait mode '{0}' (expected 'gather' or 'stream')")]
    UnknownMode(String),

    /// Empty id list.
    #[error("spin_wait requires at least one spool id")]
    Empty,
}

/// Outcome of a wait.
#[derive(Debug, Clone)]
pub struct WaitReport {
    /// Records, ordered per the mode. In gather mode every input id has a
    /// record (possibly still non-terminal at the deadline); in stream
    /// mode only terminal records appear.
    pub records: Vec<Spool>,
    /// Ids that had not terminated when the wait returned.
    pub pending: Vec<String>,
}

/// Wait for the given spools per the mode, bounded by `timeout` and the
/// cadence cap `poll_cap`.
pub async fn wait(
    store: &SpoolStore,
    ids: &[String],
    mode: WaitMode,
    timeout: Option<Duration>,
    poll_cap: Duration,
) -> Result<WaitReport, WaitError> {
    if ids.is_empty() {
        return Err(WaitError::Empty);
    }
    // Unknown ids fail synchronously, before any sleeping.
    for id in ids {
        store.get(id)?;
    }

    let deadline = timeout.map(|t| Instant::now() + t);
    let mut backoff = INITIAL_BACKOFF;
    let mut completed: Vec<Spool> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    loop {
        let mut batch: Vec<Spool> = Vec::new();
        for id in ids {
            if seen.contains(id) {
                continue;
            }
            let spool = store.get(id)?;
            if spool.status.is_terminal() {
                seen.insert(id.clone());
                batch.push(spool);
            }
        }
        // Same-tick completions tie-break by ascending id.
        batch.sort_by(|a, b| a.id.cmp(&b.id));
        completed.extend(batch);

        if seen.len() == ids.len() {
            break;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(poll_cap);
    }

    let pending: Vec<String> = ids
        .iter()
        .filter(|id| !seen.contains(*id))
        .cloned()
        .collect();

    let records = match mode {
        WaitMode::Gather => {
            // Input order, one record per id, non-terminal as observed now.
            let mut records = Vec::with_capacity(ids.len());
            for id in ids {
                records.push(store.get(id)?);
            }
            records
        }
        WaitMode::Stream => completed,
    };

    Ok(WaitReport { records, pending })
}
