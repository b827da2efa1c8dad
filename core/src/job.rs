use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Opaque job identifier (UUID v4 text).
pub type JobId = String;

/// Parameters handed to the execution collaborator. The scheduler never
/// looks inside.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Payload {
    /// Search keyword the analysis runs for.
    pub keyword: String,
    /// Free-form report options (length, sources, ...).
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// Job status. `Completed`, `Cancelled` and `Failed` are terminal.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Eligible for the due-scan.
    Active,
    /// Suspended by the owner; skipped by the due-scan.
    Paused,
    /// Ran `total_runs` times.
    Completed,
    /// Cancelled by the owner.
    Cancelled,
    /// Retry ceiling exceeded or fatal collaborator error.
    Failed,
}

impl JobStatus {
    /// Lowercase name as used in config, CLI, and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Active => "active",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(JobStatus::Active),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "cancelled" | "canceled" => Ok(JobStatus::Cancelled),
            "failed" => Ok(JobStatus::Failed),
            other => Err(StoreError::Invalid(format!("unknown status {other:?}"))),
        }
    }
}

/// Creation request for a recurring job.
#[derive(Clone, Debug)]
pub struct NewJob {
    /// Who asked for the job; used for notifications only.
    pub owner: String,
    /// Passed verbatim to the executor.
    pub payload: Payload,
    /// Minutes between runs, must be > 0.
    pub interval_minutes: u32,
    /// Number of runs before the job completes, must be > 0.
    pub total_runs: u32,
    /// First due time; `None` means "now".
    pub start_at: Option<DateTime<Utc>>,
    /// Also notify the owner on every successful run.
    pub notify: bool,
}

impl NewJob {
    /// Active job with no explicit start time and success notifications off.
    pub fn new(owner: impl Into<String>, keyword: impl Into<String>, interval_minutes: u32, total_runs: u32) -> Self {
        Self {
            owner: owner.into(),
            payload: Payload { keyword: keyword.into(), options: BTreeMap::new() },
            interval_minutes,
            total_runs,
            start_at: None,
            notify: false,
        }
    }

    /// Reject inputs that could never produce a valid record.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.interval_minutes == 0 {
            return Err(StoreError::Invalid("interval must be at least one minute".into()));
        }
        if self.total_runs == 0 {
            return Err(StoreError::Invalid("total_runs must be at least 1".into()));
        }
        if self.owner.trim().is_empty() {
            return Err(StoreError::Invalid("owner is required".into()));
        }
        Ok(())
    }

    /// Materialize the record as it is first persisted.
    pub fn into_job(self, id: JobId, now: DateTime<Utc>) -> Job {
        Job {
            id,
            owner: self.owner,
            payload: self.payload,
            interval_minutes: self.interval_minutes,
            total_runs: self.total_runs,
            completed_runs: 0,
            status: JobStatus::Active,
            next_due_at: Some(self.start_at.unwrap_or(now)),
            last_run_at: None,
            locked: false,
            lock_acquired_at: None,
            lock_token: None,
            consecutive_failures: 0,
            last_error: None,
            notify: self.notify,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Persisted job record. The store is the single source of truth for it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Job {
    /// Unique id.
    pub id: JobId,
    /// Creator.
    pub owner: String,
    /// Executor input.
    pub payload: Payload,
    /// Minutes between successful runs.
    pub interval_minutes: u32,
    /// Target number of successful runs.
    pub total_runs: u32,
    /// Successful runs so far; never decreases.
    pub completed_runs: u32,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Next eligible execution; `None` once terminal.
    pub next_due_at: Option<DateTime<Utc>>,
    /// Start of the most recent attempt.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Set while a worker owns the job.
    pub locked: bool,
    /// When the current lock was taken.
    pub lock_acquired_at: Option<DateTime<Utc>>,
    /// Identifies the current lock acquisition.
    pub lock_token: Option<String>,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Message of the last failure.
    pub last_error: Option<String>,
    /// Owner opted into per-run notifications.
    pub notify: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Interval as a duration.
    pub fn interval(&self) -> Duration {
        Duration::minutes(i64::from(self.interval_minutes))
    }

    /// Runs still owed.
    pub fn remaining_runs(&self) -> u32 {
        self.total_runs.saturating_sub(self.completed_runs)
    }

    /// `true` when the lock was taken strictly before `stale_before`, i.e. it
    /// has been held for longer than the execution ceiling.
    pub fn lock_is_stale(&self, stale_before: DateTime<Utc>) -> bool {
        self.locked && self.lock_acquired_at.map_or(true, |at| at < stale_before)
    }

    /// Active, past due, and either unlocked or holding a stale lock.
    pub fn is_dispatchable(&self, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> bool {
        self.status == JobStatus::Active
            && self.next_due_at.is_some_and(|due| due <= now)
            && (!self.locked || self.lock_is_stale(stale_before))
    }
}

/// Post-execution fields written together with the lock release.
#[derive(Clone, Debug, PartialEq)]
pub struct JobPatch {
    /// New success count.
    pub completed_runs: u32,
    /// New status (`Active`, `Completed` or `Failed`).
    pub status: JobStatus,
    /// Next due time, `None` for terminal outcomes.
    pub next_due_at: Option<DateTime<Utc>>,
    /// Start of the run being recorded.
    pub last_run_at: DateTime<Utc>,
    /// New failure streak.
    pub consecutive_failures: u32,
    /// Failure message, cleared on success.
    pub last_error: Option<String>,
}
