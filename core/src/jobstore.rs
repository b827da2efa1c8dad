//! Durable job table.
//!
//! Every mutation is a single-record conditional write; nothing here spans
//! more than one job.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::{Job, JobId, JobPatch, JobStatus, NewJob};
use crate::lifecycle::apply_owner_status;
use crate::store::{decode, encode, ns, Kv, KvSerde};

const JOB_NS: &str = "job";
const DEFAULT_CAS_ATTEMPTS: usize = 16;

/// Shared handle used by the checker, workers, and operator tools.
pub type SharedStore = Arc<dyn JobStore>;

/// Run a store call on tokio's blocking pool. [`FsKv`](crate::store::FsKv)
/// may sleep while another writer holds a key's guard file, which must not
/// stall the async workers.
pub async fn off_thread<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Backend(anyhow::Error::new(e).context("store task")))?
}

/// Job store contract. All predicates are evaluated atomically with the
/// write they guard.
pub trait JobStore: Send + Sync + 'static {
    /// Persist a new job and return its id.
    fn create(&self, new: NewJob, now: DateTime<Utc>) -> Result<JobId, StoreError>;

    /// Fetch one record.
    fn get(&self, id: &str) -> Result<Option<Job>, StoreError>;

    /// Every decodable record, oldest first.
    fn list(&self) -> Result<Vec<Job>, StoreError>;

    /// Active jobs due at `now` that are unlocked or whose lock was taken
    /// strictly before `stale_before`, oldest due first, at most `limit`.
    /// Undecodable records are skipped.
    fn scan_due(&self, now: DateTime<Utc>, stale_before: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Take the lock if the job is still dispatchable. Returns the locked
    /// record, or `None` when someone else owns it or it is no longer due.
    fn try_lock(&self, id: &str, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> Result<Option<Job>, StoreError>;

    /// Drop the lock without recording a run. No-op unless `token` still
    /// identifies the current acquisition.
    fn release(&self, id: &str, token: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Write the run outcome and drop the lock in one step. No-op (returns
    /// `false`) unless `token` still identifies the current acquisition, so a
    /// duplicate delivery or a run cancelled mid-flight changes nothing.
    fn unlock_and_update(&self, id: &str, token: &str, patch: &JobPatch, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Owner-initiated pause, resume, or cancel. Returns the updated record.
    fn set_status(&self, id: &str, status: JobStatus, now: DateTime<Utc>) -> Result<Job, StoreError>;

    /// Delete terminal jobs last written before `cutoff`. Returns how many.
    fn purge_terminal(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// [`JobStore`] over any [`Kv`] engine, one bincode record per job.
#[derive(Clone)]
pub struct KvJobStore<K: Kv> {
    kv: K,
    cas_attempts: usize,
}

impl<K: Kv> KvJobStore<K> {
    /// Store on top of `kv`.
    pub fn new(kv: K) -> Self {
        Self { kv, cas_attempts: DEFAULT_CAS_ATTEMPTS }
    }

    /// Override how many conflicting writes a single update tolerates.
    pub fn with_cas_attempts(mut self, attempts: usize) -> Self {
        self.cas_attempts = attempts.max(1);
        self
    }

    /// Underlying engine.
    pub fn kv(&self) -> &K {
        &self.kv
    }

    fn key(id: &str) -> Vec<u8> {
        ns(JOB_NS, id)
    }

    fn load(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Job)>, StoreError> {
        match self.kv.get(key)? {
            Some(bytes) => {
                let job = decode::<Job>(&bytes)?;
                Ok(Some((bytes, job)))
            }
            None => Ok(None),
        }
    }

    /// Visit every decodable job record. Records that fail to decode are
    /// logged and skipped so one bad entry cannot stall the rest of the table.
    fn each_record(&self, mut f: impl FnMut(&[u8], Vec<u8>, Job) -> Result<(), StoreError>) -> Result<(), StoreError> {
        for key in self.kv.keys(&ns(JOB_NS, ""))? {
            // A record purged between listing and reading is simply skipped.
            let Some(bytes) = self.kv.get(&key)? else { continue };
            match decode::<Job>(&bytes) {
                Ok(job) => f(&key, bytes, job)?,
                Err(e) => warn!(key = %String::from_utf8_lossy(&key), err = %e, "skipping undecodable job record"),
            }
        }
        Ok(())
    }

    /// Optimistic read-check-write. `f` mutates the record and returns
    /// `Some(out)` to commit or `None` to leave it untouched. On a conflicting
    /// write the record is re-read and `f` re-evaluated.
    fn modify<T>(&self, id: &str, mut f: impl FnMut(&mut Job) -> Result<Option<T>, StoreError>) -> Result<Option<T>, StoreError> {
        let key = Self::key(id);
        for attempt in 0..self.cas_attempts {
            let Some((before, mut job)) = self.load(&key)? else {
                return Err(StoreError::NotFound(id.to_string()));
            };
            let Some(out) = f(&mut job)? else {
                return Ok(None);
            };
            let after = encode(&job)?;
            if self.kv.compare_and_swap(&key, Some(&before), Some(&after))? {
                return Ok(Some(out));
            }
            debug!(job = id, attempt, "conflicting write, retrying");
        }
        Err(StoreError::Contention(id.to_string(), self.cas_attempts))
    }
}

impl<K: Kv> JobStore for KvJobStore<K> {
    fn create(&self, new: NewJob, now: DateTime<Utc>) -> Result<JobId, StoreError> {
        new.validate()?;
        let id = Uuid::new_v4().to_string();
        let job = new.into_job(id.clone(), now);
        let bytes = encode(&job)?;
        if !self.kv.compare_and_swap(&Self::key(&id), None, Some(&bytes))? {
            return Err(StoreError::Invalid(format!("duplicate job id {id}")));
        }
        Ok(id)
    }

    fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.kv.get_t::<Job>(&Self::key(id))?)
    }

    fn list(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::new();
        self.each_record(|_, _, job| {
            jobs.push(job);
            Ok(())
        })?;
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    fn scan_due(&self, now: DateTime<Utc>, stale_before: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        let by_due = |a: &Job, b: &Job| a.next_due_at.cmp(&b.next_due_at).then_with(|| a.id.cmp(&b.id));
        // Holds at most 2 * limit candidates however large the table is.
        let cap = limit.saturating_mul(2).max(1);
        let mut due: Vec<Job> = Vec::new();
        self.each_record(|_, _, job| {
            if job.is_dispatchable(now, stale_before) {
                due.push(job);
                if due.len() > cap {
                    due.sort_by(by_due);
                    due.truncate(limit);
                }
            }
            Ok(())
        })?;
        due.sort_by(by_due);
        due.truncate(limit);
        Ok(due)
    }

    fn try_lock(&self, id: &str, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        self.modify(id, |job| {
            if !job.is_dispatchable(now, stale_before) {
                return Ok(None);
            }
            job.locked = true;
            job.lock_acquired_at = Some(now);
            job.lock_token = Some(Uuid::new_v4().to_string());
            job.updated_at = now;
            Ok(Some(job.clone()))
        })
    }

    fn release(&self, id: &str, token: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let released = self.modify(id, |job| {
            if !job.locked || job.lock_token.as_deref() != Some(token) {
                return Ok(None);
            }
            job.locked = false;
            job.lock_acquired_at = None;
            job.lock_token = None;
            job.updated_at = now;
            Ok(Some(()))
        })?;
        Ok(released.is_some())
    }

    fn unlock_and_update(&self, id: &str, token: &str, patch: &JobPatch, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let applied = self.modify(id, |job| {
            if !job.locked || job.lock_token.as_deref() != Some(token) {
                return Ok(None);
            }
            if patch.completed_runs < job.completed_runs || patch.completed_runs > job.total_runs {
                return Err(StoreError::Invalid(format!(
                    "completed_runs {} outside {}..={}",
                    patch.completed_runs, job.completed_runs, job.total_runs
                )));
            }
            if patch.status != job.status {
                job.status.transition(patch.status)?;
            }
            if patch.status == JobStatus::Completed && patch.completed_runs != job.total_runs {
                return Err(StoreError::Invalid("completed before reaching total_runs".into()));
            }
            job.completed_runs = patch.completed_runs;
            job.status = patch.status;
            job.next_due_at = if patch.status.is_terminal() { None } else { patch.next_due_at };
            job.last_run_at = Some(patch.last_run_at);
            job.consecutive_failures = patch.consecutive_failures;
            job.last_error = patch.last_error.clone();
            job.locked = false;
            job.lock_acquired_at = None;
            job.lock_token = None;
            job.updated_at = now;
            Ok(Some(()))
        })?;
        Ok(applied.is_some())
    }

    fn set_status(&self, id: &str, status: JobStatus, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let mut unchanged = None;
        let updated = self.modify(id, |job| {
            if apply_owner_status(job, status, now)? {
                Ok(Some(job.clone()))
            } else {
                unchanged = Some(job.clone());
                Ok(None)
            }
        })?;
        updated
            .or(unchanged)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn purge_terminal(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut purged = 0;
        self.each_record(|key, bytes, job| {
            if job.status.is_terminal() && job.updated_at < cutoff && self.kv.compare_and_swap(key, Some(&bytes), None)? {
                purged += 1;
            }
            Ok(())
        })?;
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LifecycleError;
    use crate::store::MemKv;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 29, 9, 0, 0).unwrap()
    }

    fn store() -> KvJobStore<MemKv> {
        KvJobStore::new(MemKv::new())
    }

    fn success(job: &Job, at: DateTime<Utc>) -> JobPatch {
        JobPatch {
            completed_runs: job.completed_runs + 1,
            status: JobStatus::Active,
            next_due_at: Some(at + job.interval()),
            last_run_at: at,
            consecutive_failures: 0,
            last_error: None,
        }
    }

    #[test]
    fn create_rejects_invalid_input() {
        let s = store();
        assert!(matches!(s.create(NewJob::new("mina", "rust", 0, 1), t0()), Err(StoreError::Invalid(_))));
        assert!(s.list().unwrap().is_empty());
    }

    #[test]
    fn scan_due_orders_oldest_first_and_limits() {
        let s = store();
        let mut late = NewJob::new("a", "late", 10, 1);
        late.start_at = Some(t0() - Duration::minutes(1));
        let mut early = NewJob::new("a", "early", 10, 1);
        early.start_at = Some(t0() - Duration::minutes(5));
        let mut future = NewJob::new("a", "future", 10, 1);
        future.start_at = Some(t0() + Duration::minutes(5));
        let late = s.create(late, t0()).unwrap();
        let early = s.create(early, t0()).unwrap();
        s.create(future, t0()).unwrap();

        let due = s.scan_due(t0(), t0() - Duration::hours(1), 10).unwrap();
        assert_eq!(due.iter().map(|j| j.id.clone()).collect::<Vec<_>>(), vec![early.clone(), late]);
        assert_eq!(s.scan_due(t0(), t0() - Duration::hours(1), 1).unwrap().len(), 1);
    }

    #[test]
    fn scan_due_keeps_oldest_across_a_large_table() {
        let s = store();
        let mut ids = Vec::new();
        for i in 0..12 {
            let mut req = NewJob::new("a", format!("k{i}"), 10, 1);
            req.start_at = Some(t0() - Duration::minutes(60 - i));
            ids.push(s.create(req, t0()).unwrap());
        }
        let done = s.create(NewJob::new("a", "done", 10, 1), t0() - Duration::days(1)).unwrap();
        s.set_status(&done, JobStatus::Cancelled, t0()).unwrap();

        let due = s.scan_due(t0(), t0() - Duration::hours(1), 3).unwrap();
        assert_eq!(due.into_iter().map(|j| j.id).collect::<Vec<_>>(), ids[..3].to_vec());
    }

    #[test]
    fn undecodable_record_is_skipped() {
        let s = store();
        let healthy = s.create(NewJob::new("a", "k", 10, 1), t0()).unwrap();
        assert!(s.kv().compare_and_swap(&ns(JOB_NS, "zzz-corrupt"), None, Some(b"not a job")).unwrap());

        assert_eq!(s.list().unwrap().len(), 1);
        let due = s.scan_due(t0(), t0() - Duration::hours(1), 10).unwrap();
        assert_eq!(due.into_iter().map(|j| j.id).collect::<Vec<_>>(), vec![healthy]);
        assert_eq!(s.purge_terminal(t0() + Duration::days(1)).unwrap(), 0);
    }

    #[test]
    fn lock_is_not_reclaimed_at_exactly_max_execution() {
        let s = store();
        let id = s.create(NewJob::new("a", "k", 10, 1), t0()).unwrap();
        s.try_lock(&id, t0(), t0() - Duration::minutes(30)).unwrap().unwrap();

        let at = t0() + Duration::minutes(30);
        assert!(s.try_lock(&id, at, at - Duration::minutes(30)).unwrap().is_none());
        let after = at + Duration::seconds(1);
        assert!(s.try_lock(&id, after, after - Duration::minutes(30)).unwrap().is_some());
    }

    #[test]
    fn paused_jobs_are_never_scanned() {
        let s = store();
        let id = s.create(NewJob::new("a", "k", 10, 1), t0() - Duration::days(1)).unwrap();
        s.set_status(&id, JobStatus::Paused, t0()).unwrap();
        assert!(s.scan_due(t0() + Duration::days(365), t0(), 10).unwrap().is_empty());
        assert!(s.try_lock(&id, t0(), t0() - Duration::hours(1)).unwrap().is_none());
    }

    #[test]
    fn second_lock_attempt_fails_until_stale() {
        let s = store();
        let id = s.create(NewJob::new("a", "k", 10, 1), t0()).unwrap();
        let stale_before = t0() - Duration::minutes(30);
        let first = s.try_lock(&id, t0(), stale_before).unwrap().unwrap();
        assert!(first.locked);
        assert!(s.try_lock(&id, t0(), stale_before).unwrap().is_none());
        assert!(s.scan_due(t0(), stale_before, 10).unwrap().is_empty());

        let later = t0() + Duration::minutes(31);
        let reclaimed = s.try_lock(&id, later, later - Duration::minutes(30)).unwrap().unwrap();
        assert_ne!(reclaimed.lock_token, first.lock_token);
        assert!(!s.release(&id, first.lock_token.as_deref().unwrap(), later).unwrap());
    }

    #[test]
    fn duplicate_completion_write_is_ignored() {
        let s = store();
        let id = s.create(NewJob::new("a", "k", 60, 3), t0()).unwrap();
        let locked = s.try_lock(&id, t0(), t0()).unwrap().unwrap();
        let token = locked.lock_token.clone().unwrap();
        let patch = success(&locked, t0());
        assert!(s.unlock_and_update(&id, &token, &patch, t0()).unwrap());
        assert!(!s.unlock_and_update(&id, &token, &patch, t0()).unwrap());
        let job = s.get(&id).unwrap().unwrap();
        assert_eq!(job.completed_runs, 1);
        assert!(!job.locked);
        assert_eq!(job.next_due_at, Some(t0() + Duration::minutes(60)));
    }

    #[test]
    fn update_refuses_regressions_and_early_completion() {
        let s = store();
        let id = s.create(NewJob::new("a", "k", 60, 3), t0()).unwrap();
        let locked = s.try_lock(&id, t0(), t0()).unwrap().unwrap();
        let token = locked.lock_token.clone().unwrap();
        let mut patch = success(&locked, t0());
        patch.status = JobStatus::Completed;
        assert!(matches!(s.unlock_and_update(&id, &token, &patch, t0()), Err(StoreError::Invalid(_))));
        patch.status = JobStatus::Active;
        patch.completed_runs = 4;
        assert!(matches!(s.unlock_and_update(&id, &token, &patch, t0()), Err(StoreError::Invalid(_))));
        assert!(s.get(&id).unwrap().unwrap().locked);
    }

    #[test]
    fn cancel_mid_flight_turns_completion_into_noop() {
        let s = store();
        let id = s.create(NewJob::new("a", "k", 60, 3), t0()).unwrap();
        let locked = s.try_lock(&id, t0(), t0()).unwrap().unwrap();
        let cancelled = s.set_status(&id, JobStatus::Cancelled, t0()).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(!cancelled.locked);

        let patch = success(&locked, t0());
        assert!(!s.unlock_and_update(&id, locked.lock_token.as_deref().unwrap(), &patch, t0()).unwrap());
        let job = s.get(&id).unwrap().unwrap();
        assert_eq!(job.completed_runs, 0);
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.next_due_at, None);
    }

    #[test]
    fn pause_while_locked_is_busy() {
        let s = store();
        let id = s.create(NewJob::new("a", "k", 60, 3), t0()).unwrap();
        s.try_lock(&id, t0(), t0()).unwrap().unwrap();
        assert!(matches!(
            s.set_status(&id, JobStatus::Paused, t0()),
            Err(StoreError::Lifecycle(LifecycleError::Busy(_)))
        ));
    }

    #[test]
    fn set_status_on_missing_job() {
        let s = store();
        assert!(matches!(s.set_status("nope", JobStatus::Paused, t0()), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn purge_only_removes_old_terminal_jobs() {
        let s = store();
        let old = s.create(NewJob::new("a", "old", 60, 3), t0()).unwrap();
        let active = s.create(NewJob::new("a", "live", 60, 3), t0()).unwrap();
        let recent = s.create(NewJob::new("a", "recent", 60, 3), t0()).unwrap();
        s.set_status(&old, JobStatus::Cancelled, t0()).unwrap();
        s.set_status(&recent, JobStatus::Cancelled, t0() + Duration::days(40)).unwrap();

        let purged = s.purge_terminal(t0() + Duration::days(30)).unwrap();
        assert_eq!(purged, 1);
        assert!(s.get(&old).unwrap().is_none());
        assert!(s.get(&active).unwrap().is_some());
        assert!(s.get(&recent).unwrap().is_some());
    }
}
