use thiserror::Error;

use crate::job::{JobId, JobStatus};

/// Errors surfaced by a [`JobStore`](crate::jobstore::JobStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record exists for the id.
    #[error("job {0} not found")]
    NotFound(JobId),
    /// The compare-and-swap loop gave up after repeated conflicting writers.
    #[error("job {0}: gave up after {1} conflicting writes")]
    Contention(JobId, usize),
    /// The input was rejected before anything was written.
    #[error("invalid job: {0}")]
    Invalid(String),
    /// The requested status change is not allowed.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    /// The backing KV engine failed (I/O, codec, guard timeout).
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Rejected status transition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    /// `from -> to` is not an edge of the state machine.
    #[error("illegal transition {from} -> {to}")]
    Illegal {
        /// Current status.
        from: JobStatus,
        /// Requested status.
        to: JobStatus,
    },
    /// The job is executing; only cancellation may interrupt it.
    #[error("job {0} is executing; retry once the run finishes")]
    Busy(JobId),
}

/// Invalid scheduler settings.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid scheduler config: {0}")]
pub struct ConfigError(pub String);

/// Failure to start or drive a scheduler instance.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Settings rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The store failed during a pass.
    #[error(transparent)]
    Store(#[from] StoreError),
}
