//! One scheduler instance: a checker, an execution queue, and a worker pool
//! over a shared store. Instances hold no global state; any number may run
//! against the same store, in one process or many.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cfg::SchedulerConfig;
use crate::checker::{Checker, TickReport};
use crate::clock::{Clock, SystemClock};
use crate::collab::{JobExecutor, LogNotifier, Notifier};
use crate::error::SchedulerError;
use crate::jobstore::{off_thread, SharedStore};
use crate::lock::LockProtocol;
use crate::queue::{self, QueueRx};
use crate::worker::{RunReport, Worker};

/// Dependencies and settings of an instance.
#[derive(Clone)]
pub struct Scheduler {
    store: SharedStore,
    executor: Arc<dyn JobExecutor>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    cfg: SchedulerConfig,
}

/// Result of [`Scheduler::run_once`].
#[derive(Debug, Default)]
pub struct OnceReport {
    /// The single checker pass.
    pub tick: TickReport,
    /// Outcome per executed job, in completion order.
    pub runs: Vec<RunReport>,
    /// Runs whose outcome could not be recorded.
    pub errors: usize,
}

impl Scheduler {
    /// Instance on the system clock with log-only notifications.
    pub fn new(store: SharedStore, executor: Arc<dyn JobExecutor>, cfg: SchedulerConfig) -> Self {
        Self {
            store,
            executor,
            notifier: Arc::new(LogNotifier),
            clock: Arc::new(SystemClock),
            cfg,
        }
    }

    /// Replace the notifier.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Settings in use.
    pub fn config(&self) -> &SchedulerConfig {
        &self.cfg
    }

    fn lock(&self) -> LockProtocol {
        LockProtocol::new(self.store.clone(), self.cfg.max_execution())
    }

    fn worker(&self, id: usize) -> Worker {
        Worker::new(
            id,
            self.store.clone(),
            self.executor.clone(),
            self.notifier.clone(),
            self.clock.clone(),
            self.cfg.retry_policy(),
            self.cfg.exec_timeout(),
        )
        .with_notify_on_success(self.cfg.notify_on_success)
    }

    /// Start the checker and workers on the current runtime.
    pub fn spawn(self) -> Result<SchedulerHandle, SchedulerError> {
        self.cfg.validate()?;
        let (tx, rx) = queue::bounded(self.cfg.queue_capacity);
        let (shutdown, watch_rx) = watch::channel(false);

        let checker = Checker::new(self.store.clone(), self.lock(), tx, self.clock.clone(), self.cfg.page_size);
        let checker = tokio::spawn(checker.run(self.cfg.tick(), watch_rx.clone()));
        let workers = (0..self.cfg.workers)
            .map(|id| tokio::spawn(self.worker(id).run(rx.clone(), watch_rx.clone())))
            .collect();

        info!(
            workers = self.cfg.workers,
            tick_secs = self.cfg.tick_secs,
            queue = self.cfg.queue_capacity,
            "scheduler started"
        );
        Ok(SchedulerHandle { shutdown, checker, workers, rx, lock: self.lock(), clock: self.clock })
    }

    /// A single checker pass, then run everything it enqueued to completion.
    /// Useful for cron-driven deployments and tests.
    pub async fn run_once(&self) -> Result<OnceReport, SchedulerError> {
        self.cfg.validate()?;
        let (tx, rx) = queue::bounded(self.cfg.queue_capacity);
        let tick = {
            let checker = Checker::new(self.store.clone(), self.lock(), tx, self.clock.clone(), self.cfg.page_size);
            checker.tick_off_thread().await?
            // Dropping the checker closes the queue once it drains.
        };

        let pool: Vec<JoinHandle<(Vec<RunReport>, usize)>> = (0..self.cfg.workers)
            .map(|id| {
                let worker = self.worker(id);
                let rx = rx.clone();
                tokio::spawn(async move {
                    let mut runs = Vec::new();
                    let mut errors = 0;
                    while let Some(lease) = rx.pop().await {
                        match worker.run_one(lease).await {
                            Ok(r) => runs.push(r),
                            Err(e) => {
                                error!(worker = worker.id, err = %e, "could not record run outcome");
                                errors += 1;
                            }
                        }
                    }
                    (runs, errors)
                })
            })
            .collect();

        let mut report = OnceReport { tick, ..Default::default() };
        for handle in pool {
            match handle.await {
                Ok((runs, errors)) => {
                    report.runs.extend(runs);
                    report.errors += errors;
                }
                Err(e) => {
                    error!(err = %e, "worker task panicked");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }
}

/// Running instance.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    checker: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    rx: QueueRx,
    lock: LockProtocol,
    clock: Arc<dyn Clock>,
}

impl SchedulerHandle {
    /// Stop ticking, let in-flight runs finish, and release every lease still
    /// queued so peers can take those jobs. Returns how many were released.
    pub async fn shutdown(self) -> usize {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.checker.await {
            error!(err = %e, "checker task panicked");
        }

        let now = self.clock.now();
        let drained = self.rx.close_and_drain().await;
        let lock = self.lock.clone();
        let released = off_thread(move || {
            let mut released = 0usize;
            for lease in drained {
                match lock.release(&lease, now) {
                    Ok(true) => released += 1,
                    Ok(false) => {}
                    Err(e) => warn!(job = %lease.id(), err = %e, "release on drain failed; lock will go stale"),
                }
            }
            Ok(released)
        })
        .await
        .unwrap_or_else(|e| {
            error!(err = %e, "drain release task failed");
            0
        });

        for w in self.workers {
            if let Err(e) = w.await {
                error!(err = %e, "worker task panicked");
            }
        }
        info!(released, "scheduler stopped");
        released
    }
}
