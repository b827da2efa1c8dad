#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use cadence_core::cfg::SchedulerConfig;
use cadence_core::clock::ManualClock;
use cadence_core::collab::{ExecError, JobExecutor, Notification, Notifier};
use cadence_core::store::MemKv;
use cadence_core::{KvJobStore, Payload, SharedStore};
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Semaphore;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 29, 9, 0, 0).unwrap()
}

pub fn mem_store(kv: &MemKv) -> SharedStore {
    cadence_core::logx::init_for_tests();
    Arc::new(KvJobStore::new(kv.clone()))
}

pub fn config() -> SchedulerConfig {
    SchedulerConfig {
        tick_secs: 1,
        page_size: 10,
        queue_capacity: 8,
        workers: 2,
        max_execution_secs: 1800,
        exec_timeout_secs: 60,
        max_consecutive_failures: 3,
        backoff_base_secs: 30,
        backoff_cap_secs: 600,
        notify_on_success: false,
    }
}

pub fn clock() -> ManualClock {
    ManualClock::new(t0())
}

/// Executor that plays back queued outcomes, then succeeds.
#[derive(Default)]
pub struct Script {
    outcomes: Mutex<VecDeque<Result<(), ExecError>>>,
    calls: AtomicUsize,
    delay: Option<StdDuration>,
    gate: Option<Arc<Semaphore>>,
}

impl Script {
    pub fn ok() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with(outcomes: Vec<Result<(), ExecError>>) -> Arc<Self> {
        Arc::new(Self { outcomes: Mutex::new(outcomes.into()), ..Default::default() })
    }

    pub fn slow(delay: StdDuration) -> Arc<Self> {
        Arc::new(Self { delay: Some(delay), ..Default::default() })
    }

    pub fn gated(gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self { gate: Some(gate), ..Default::default() })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobExecutor for Script {
    async fn execute(&self, _job_id: &str, _payload: &Payload) -> Result<(), ExecError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

#[derive(Default)]
pub struct Inbox {
    pub notes: Mutex<Vec<Notification>>,
}

impl Inbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notes(&self) -> Vec<Notification> {
        self.notes.lock().unwrap().clone()
    }

    /// Notifications are delivered on detached tasks; give them a chance to run.
    pub async fn settle(&self, expected: usize) -> Vec<Notification> {
        for _ in 0..200 {
            if self.notes.lock().unwrap().len() >= expected {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        // One more round so stray extras would show up.
        tokio::task::yield_now().await;
        self.notes()
    }
}

#[async_trait]
impl Notifier for Inbox {
    async fn notify(&self, note: &Notification) -> anyhow::Result<()> {
        self.notes.lock().unwrap().push(note.clone());
        Ok(())
    }
}

/// Notifier that always errors; the worker must shrug it off.
pub struct Broken;

#[async_trait]
impl Notifier for Broken {
    async fn notify(&self, _note: &Notification) -> anyhow::Result<()> {
        anyhow::bail!("push gateway down")
    }
}

pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
    panic!("condition not reached");
}
