use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::StoreError;
use crate::jobstore::{off_thread, SharedStore};
use crate::lock::LockProtocol;
use crate::queue::{OfferError, QueueTx};

/// Counters from one checker pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Candidates returned by the due-scan.
    pub scanned: usize,
    /// Candidates someone else locked first.
    pub contended: usize,
    /// Locks taken over from a presumed-dead holder.
    pub reclaimed: usize,
    /// Leases handed to the queue.
    pub enqueued: usize,
    /// Candidates left for the next tick because the queue was full.
    pub deferred: usize,
}

/// Periodic due-scan and dispatch. One per scheduler instance, never
/// concurrent with itself.
#[derive(Clone)]
pub struct Checker {
    store: SharedStore,
    lock: LockProtocol,
    queue: QueueTx,
    clock: Arc<dyn Clock>,
    page_size: usize,
}

impl Checker {
    /// Checker feeding `queue`, examining at most `page_size` jobs per tick.
    pub fn new(store: SharedStore, lock: LockProtocol, queue: QueueTx, clock: Arc<dyn Clock>, page_size: usize) -> Self {
        Self { store, lock, queue, clock, page_size }
    }

    /// One pass: scan, lock in due order, enqueue. A store error abandons the
    /// pass; anything already enqueued stays enqueued.
    pub fn tick(&self) -> Result<TickReport, StoreError> {
        let now = self.clock.now();
        let candidates = self.store.scan_due(now, self.lock.stale_before(now), self.page_size)?;
        let mut report = TickReport { scanned: candidates.len(), ..Default::default() };

        for (i, job) in candidates.iter().enumerate() {
            let Some(lease) = self.lock.acquire(job, now)? else {
                report.contended += 1;
                continue;
            };
            if lease.reclaimed {
                report.reclaimed += 1;
            }
            match self.queue.offer(lease) {
                Ok(()) => report.enqueued += 1,
                Err(OfferError::Full(lease)) | Err(OfferError::Closed(lease)) => {
                    // Don't sit on a lock nobody can service; retry next tick.
                    self.lock.release(&lease, now)?;
                    report.deferred = candidates.len() - i;
                    debug!(job = %lease.id(), deferred = report.deferred, "queue unavailable, released");
                    break;
                }
            }
        }
        Ok(report)
    }

    /// [`tick`](Self::tick) on the blocking pool.
    pub async fn tick_off_thread(&self) -> Result<TickReport, StoreError> {
        let this = self.clone();
        off_thread(move || this.tick()).await
    }

    /// Tick every `period` until `shutdown` flips.
    pub async fn run(self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.tick_off_thread().await {
                        Ok(r) if r.deferred > 0 => warn!(
                            enqueued = r.enqueued, deferred = r.deferred, queued = self.queue.len(),
                            "queue full; workers are falling behind"
                        ),
                        Ok(r) if r.scanned > 0 => info!(
                            scanned = r.scanned, enqueued = r.enqueued, contended = r.contended,
                            reclaimed = r.reclaimed, "tick"
                        ),
                        Ok(_) => debug!("tick: nothing due"),
                        Err(e) => error!(err = %e, "tick abandoned; retrying next period"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("checker stopping");
                        break;
                    }
                }
            }
        }
    }
}
