//! Worker pool: pop a lease, run the job, record the outcome, release.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::collab::{dispatch, ExecError, JobExecutor, Notification, NotificationKind, Notifier};
use crate::error::StoreError;
use crate::job::{Job, JobPatch, JobStatus};
use crate::jobstore::{off_thread, SharedStore};
use crate::lock::Lease;
use crate::queue::QueueRx;

/// Transient-failure handling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failures in a row that turn the job `failed`.
    pub max_consecutive_failures: u32,
    /// Delay before the first retry.
    pub backoff_base: Duration,
    /// Upper bound on any delay.
    pub backoff_cap: Duration,
}

impl RetryPolicy {
    /// Delay after the `failures`-th failure in a row: `base * 2^(failures-1)`,
    /// capped.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(30);
        let factor = 1i32 << exp;
        self.backoff_base
            .checked_mul(factor)
            .map_or(self.backoff_cap, |d| d.min(self.backoff_cap))
    }
}

/// How a run ended, as recorded in the store.
#[derive(Clone, Debug, PartialEq)]
pub enum RunReport {
    /// Run succeeded; `finished` when it was the last one.
    Succeeded {
        /// Successful runs now recorded.
        completed_runs: u32,
        /// The job reached its run target.
        finished: bool,
    },
    /// Transient failure, retried at `retry_at`.
    Retrying {
        /// Failure streak.
        consecutive_failures: u32,
        /// Next attempt.
        retry_at: DateTime<Utc>,
    },
    /// Job is now `failed`.
    Failed {
        /// Why.
        reason: String,
    },
    /// The lock was no longer ours (cancelled or reclaimed); nothing written.
    Superseded,
}

/// Compute the post-run record for `job` given the executor outcome.
/// `started` is when the run began; the next due time counts from it.
pub fn settle(job: &Job, outcome: &Result<(), ExecError>, started: DateTime<Utc>, now: DateTime<Utc>, policy: &RetryPolicy) -> JobPatch {
    match outcome {
        Ok(()) => {
            let completed_runs = (job.completed_runs + 1).min(job.total_runs);
            let finished = completed_runs >= job.total_runs;
            JobPatch {
                completed_runs,
                status: if finished { JobStatus::Completed } else { JobStatus::Active },
                next_due_at: if finished { None } else { Some(started + job.interval()) },
                last_run_at: started,
                consecutive_failures: 0,
                last_error: None,
            }
        }
        Err(err) => {
            let failures = job.consecutive_failures.saturating_add(1);
            let exhausted = !err.is_transient() || failures >= policy.max_consecutive_failures;
            JobPatch {
                completed_runs: job.completed_runs,
                status: if exhausted { JobStatus::Failed } else { JobStatus::Active },
                next_due_at: if exhausted { None } else { Some(now + policy.backoff(failures)) },
                last_run_at: started,
                consecutive_failures: failures,
                last_error: Some(err.to_string()),
            }
        }
    }
}

/// One consumer of the execution queue.
#[derive(Clone)]
pub struct Worker {
    /// Index within the pool, for logs.
    pub id: usize,
    store: SharedStore,
    executor: Arc<dyn JobExecutor>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    exec_timeout: StdDuration,
    notify_on_success: bool,
}

impl Worker {
    /// Worker `id` of a pool.
    pub fn new(
        id: usize,
        store: SharedStore,
        executor: Arc<dyn JobExecutor>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
        exec_timeout: StdDuration,
    ) -> Self {
        Self { id, store, executor, notifier, clock, policy, exec_timeout, notify_on_success: false }
    }

    /// Notify on every success, not only for jobs that opted in.
    pub fn with_notify_on_success(mut self, on: bool) -> Self {
        self.notify_on_success = on;
        self
    }

    /// Execute one leased job and settle it.
    pub async fn run_one(&self, lease: Lease) -> Result<RunReport, StoreError> {
        let job = &lease.job;
        let started = self.clock.now();
        debug!(worker = self.id, job = %job.id, run = job.completed_runs + 1, "executing");

        let outcome = match timeout(self.exec_timeout, self.executor.execute(&job.id, &job.payload)).await {
            Ok(res) => res,
            Err(_) => Err(ExecError::Transient(format!("timed out after {:?}", self.exec_timeout))),
        };

        let now = self.clock.now();
        let patch = settle(job, &outcome, started, now, &self.policy);
        let applied = {
            let (store, id, token, patch) = (self.store.clone(), job.id.clone(), lease.token.clone(), patch.clone());
            off_thread(move || store.unlock_and_update(&id, &token, &patch, now)).await?
        };
        if !applied {
            info!(worker = self.id, job = %job.id, "lock lost during run (cancelled or reclaimed); outcome dropped");
            return Ok(RunReport::Superseded);
        }

        let report = match (&outcome, patch.status) {
            (Ok(()), status) => {
                let finished = status == JobStatus::Completed;
                info!(worker = self.id, job = %job.id, run = patch.completed_runs, total = job.total_runs, finished, "run ok");
                RunReport::Succeeded { completed_runs: patch.completed_runs, finished }
            }
            (Err(e), JobStatus::Failed) => {
                error!(worker = self.id, job = %job.id, failures = patch.consecutive_failures, err = %e, "job failed");
                RunReport::Failed { reason: e.to_string() }
            }
            (Err(e), _) => {
                let retry_at = patch.next_due_at.unwrap_or(now);
                warn!(worker = self.id, job = %job.id, failures = patch.consecutive_failures, %retry_at, err = %e, "run failed, will retry");
                RunReport::Retrying { consecutive_failures: patch.consecutive_failures, retry_at }
            }
        };
        self.announce(job, &report);
        Ok(report)
    }

    fn announce(&self, job: &Job, report: &RunReport) {
        let kind = match report {
            RunReport::Failed { reason } => NotificationKind::Failed {
                reason: reason.clone(),
                consecutive_failures: job.consecutive_failures + 1,
            },
            RunReport::Succeeded { completed_runs, finished } if job.notify || self.notify_on_success => {
                if *finished {
                    NotificationKind::Completed { total: *completed_runs }
                } else {
                    NotificationKind::RunSucceeded { run: *completed_runs, total: job.total_runs }
                }
            }
            _ => return,
        };
        dispatch(&self.notifier, Notification { job_id: job.id.clone(), owner: job.owner.clone(), kind });
    }

    /// Consume `rx` until it closes or `shutdown` flips. A run in progress is
    /// always finished before the worker exits.
    pub async fn run(self, rx: QueueRx, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let lease = tokio::select! {
                lease = rx.pop() => match lease {
                    Some(l) => l,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() { break; }
                    continue;
                }
            };
            let id = lease.job.id.clone();
            if let Err(e) = self.run_one(lease).await {
                // The lock stays set; stale-lock reclaim picks the job up later.
                error!(worker = self.id, job = %id, err = %e, "could not record run outcome");
            }
        }
        debug!(worker = self.id, "worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewJob;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 29, 9, 0, 0).unwrap()
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_consecutive_failures: 3,
            backoff_base: Duration::seconds(30),
            backoff_cap: Duration::seconds(100),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::seconds(30));
        assert_eq!(p.backoff(2), Duration::seconds(60));
        assert_eq!(p.backoff(3), Duration::seconds(100));
        assert_eq!(p.backoff(400), Duration::seconds(100));
    }

    #[test]
    fn success_advances_from_run_start() {
        let job = NewJob::new("a", "k", 60, 3).into_job("j".into(), t0());
        let patch = settle(&job, &Ok(()), t0(), t0() + Duration::minutes(2), &policy());
        assert_eq!(patch.completed_runs, 1);
        assert_eq!(patch.status, JobStatus::Active);
        assert_eq!(patch.next_due_at, Some(t0() + Duration::minutes(60)));
    }

    #[test]
    fn last_success_completes() {
        let mut job = NewJob::new("a", "k", 60, 3).into_job("j".into(), t0());
        job.completed_runs = 2;
        job.consecutive_failures = 2;
        let patch = settle(&job, &Ok(()), t0(), t0(), &policy());
        assert_eq!(patch.completed_runs, 3);
        assert_eq!(patch.status, JobStatus::Completed);
        assert_eq!(patch.next_due_at, None);
        assert_eq!(patch.consecutive_failures, 0);
    }

    #[test]
    fn transient_failure_backs_off_then_fails_at_ceiling() {
        let mut job = NewJob::new("a", "k", 60, 3).into_job("j".into(), t0());
        let err = Err(ExecError::Transient("rate limited".into()));
        let patch = settle(&job, &err, t0(), t0(), &policy());
        assert_eq!(patch.status, JobStatus::Active);
        assert_eq!(patch.next_due_at, Some(t0() + Duration::seconds(30)));
        assert_eq!(patch.completed_runs, 0);

        job.consecutive_failures = 2;
        let patch = settle(&job, &err, t0(), t0(), &policy());
        assert_eq!(patch.status, JobStatus::Failed);
        assert_eq!(patch.next_due_at, None);
        assert_eq!(patch.consecutive_failures, 3);
    }

    #[test]
    fn fatal_failure_is_immediately_terminal() {
        let job = NewJob::new("a", "k", 60, 3).into_job("j".into(), t0());
        let patch = settle(&job, &Err(ExecError::Fatal("bad payload".into())), t0(), t0(), &policy());
        assert_eq!(patch.status, JobStatus::Failed);
        assert_eq!(patch.last_error.as_deref(), Some("fatal: bad payload"));
    }
}
