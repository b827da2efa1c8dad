//! Job status state machine.
//!
//! ```text
//! active --pause--> paused --resume--> active
//! active --run target met--> completed
//! active|paused --cancel--> cancelled
//! active --retries exhausted / fatal--> failed
//! ```
//!
//! Terminal states have no outgoing edges.

use chrono::{DateTime, Utc};

use crate::error::LifecycleError;
use crate::job::{Job, JobStatus};

impl JobStatus {
    /// `completed`, `cancelled` or `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed)
    }

    /// Whether `self -> to` is an edge of the state machine.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Active, Paused)
                | (Paused, Active)
                | (Active, Completed)
                | (Active, Cancelled)
                | (Paused, Cancelled)
                | (Active, Failed)
        )
    }

    /// Validate `self -> to`.
    pub fn transition(self, to: JobStatus) -> Result<JobStatus, LifecycleError> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(LifecycleError::Illegal { from: self, to })
        }
    }
}

/// Owner-initiated status change (pause, resume, cancel).
///
/// Returns `Ok(false)` when the job is already in `to`, so repeated requests
/// are harmless. Pausing an executing job is refused; cancelling one clears
/// the lock so the in-flight run's completion write becomes a no-op.
pub fn apply_owner_status(job: &mut Job, to: JobStatus, now: DateTime<Utc>) -> Result<bool, LifecycleError> {
    if job.status == to {
        return Ok(false);
    }
    if to == JobStatus::Completed || to == JobStatus::Failed {
        // Only the worker reaches these, through its post-run patch.
        return Err(LifecycleError::Illegal { from: job.status, to });
    }
    if to == JobStatus::Paused && job.locked {
        return Err(LifecycleError::Busy(job.id.clone()));
    }
    job.status = job.status.transition(to)?;
    if to.is_terminal() {
        job.next_due_at = None;
        job.locked = false;
        job.lock_acquired_at = None;
        job.lock_token = None;
    }
    job.updated_at = now;
    Ok(true)
}
