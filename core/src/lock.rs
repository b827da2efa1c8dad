//! Flag-based mutual exclusion over job records.
//!
//! A lock is the `locked` flag plus a per-acquisition token, set by the
//! store's conditional write. A lock older than `max_execution` is presumed
//! abandoned by a crashed worker and may be taken over: a crashed holder can
//! never release it, so the job is re-executed rather than stalled forever.
//! This makes execution at-least-once when a live run outlasts the window.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::job::Job;
use crate::jobstore::SharedStore;

/// A job this process owns until released or settled.
#[derive(Clone, Debug)]
pub struct Lease {
    /// Snapshot of the record right after locking.
    pub job: Job,
    /// Acquisition token; every later write is conditional on it.
    pub token: String,
    /// The previous holder's lock was stale and got taken over.
    pub reclaimed: bool,
}

impl Lease {
    /// Id of the leased job.
    pub fn id(&self) -> &str {
        &self.job.id
    }
}

/// Acquire/release over a shared store.
#[derive(Clone)]
pub struct LockProtocol {
    store: SharedStore,
    max_execution: Duration,
}

impl LockProtocol {
    /// Locks older than `max_execution` count as abandoned.
    pub fn new(store: SharedStore, max_execution: Duration) -> Self {
        Self { store, max_execution }
    }

    /// Locks taken strictly before this instant are stale at `now`.
    pub fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.max_execution
    }

    /// Try to own `candidate`. `Ok(None)` means another owner holds it or it
    /// stopped being due since the scan; neither is an error.
    pub fn acquire(&self, candidate: &Job, now: DateTime<Utc>) -> Result<Option<Lease>, StoreError> {
        let stale_before = self.stale_before(now);
        let reclaimed = candidate.lock_is_stale(stale_before);
        let Some(job) = self.store.try_lock(&candidate.id, now, stale_before)? else {
            debug!(job = %candidate.id, "lock held elsewhere, skipping");
            return Ok(None);
        };
        let Some(token) = job.lock_token.clone() else {
            return Err(StoreError::Invalid(format!("job {} locked without a token", job.id)));
        };
        if reclaimed {
            warn!(
                job = %job.id,
                held_since = ?candidate.lock_acquired_at,
                "reclaiming stale lock; the job may run twice"
            );
        }
        Ok(Some(Lease { job, token, reclaimed }))
    }

    /// Give the job back without recording a run.
    pub fn release(&self, lease: &Lease, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.store.release(lease.id(), &lease.token, now)
    }
}
