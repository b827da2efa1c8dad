mod common;

use std::sync::Arc;

use cadence_core::store::MemKv;
use cadence_core::{JobStatus, NewJob, Scheduler};
use common::*;
use tokio::sync::Semaphore;

#[tokio::test]
async fn spawned_instance_runs_due_job_and_stops() {
    let kv = MemKv::new();
    let store = mem_store(&kv);
    let exec = Script::ok();
    let id = store.create(NewJob::new("mina", "rust", 60, 1), t0()).unwrap();

    let handle = Scheduler::new(store.clone(), exec.clone(), config())
        .with_clock(Arc::new(clock()))
        .spawn()
        .unwrap();

    let seen = store.clone();
    let seen_id = id.clone();
    wait_for(move || seen.get(&seen_id).unwrap().unwrap().status == JobStatus::Completed).await;
    assert_eq!(handle.shutdown().await, 0);
    assert_eq!(exec.calls(), 1);
}

#[tokio::test]
async fn shutdown_releases_queued_leases_and_finishes_in_flight() {
    let kv = MemKv::new();
    let store = mem_store(&kv);
    let gate = Arc::new(Semaphore::new(0));
    let exec = Script::gated(gate.clone());
    for k in ["a", "b", "c"] {
        store.create(NewJob::new("mina", k, 60, 2), t0()).unwrap();
    }

    let mut cfg = config();
    cfg.workers = 1;
    let handle = Scheduler::new(store.clone(), exec.clone(), cfg)
        .with_clock(Arc::new(clock()))
        .spawn()
        .unwrap();

    let seen = exec.clone();
    wait_for(move || seen.calls() == 1).await;
    let seen = store.clone();
    wait_for(move || seen.list().unwrap().iter().filter(|j| j.locked).count() == 3).await;

    let stopping = tokio::spawn(handle.shutdown());
    // Queued leases are handed back before the in-flight run is allowed to end.
    let seen = store.clone();
    wait_for(move || seen.list().unwrap().iter().filter(|j| j.locked).count() == 1).await;
    gate.add_permits(8);
    let released = stopping.await.unwrap();
    assert_eq!(released, 2);
    assert_eq!(exec.calls(), 1);

    let jobs = store.list().unwrap();
    assert!(jobs.iter().all(|j| !j.locked));
    assert_eq!(jobs.iter().map(|j| j.completed_runs).sum::<u32>(), 1);
}

#[test]
fn spawn_rejects_invalid_config() {
    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    rt.block_on(async {
        let mut cfg = config();
        cfg.max_execution_secs = cfg.exec_timeout_secs;
        let res = Scheduler::new(mem_store(&MemKv::new()), Script::ok(), cfg).spawn();
        assert!(res.is_err());
    });
}
