#![warn(missing_docs)]
//! cadence_core: recurring-job scheduling over a shared store (config, KV,
//! logging, job model, lock protocol, checker, worker pool).

/// Configuration helpers (AppId, dirs, load_or_init, scheduler settings).
pub mod cfg;
/// Tracing/log initialization helpers.
pub mod logx;
/// File-backed and in-memory KV engines with compare-and-swap.
pub mod store;
/// Typed errors.
pub mod error;
/// Job record and creation request.
pub mod job;
/// Status state machine.
pub mod lifecycle;
/// Durable job table.
pub mod jobstore;
/// Injectable time source.
pub mod clock;
/// Lock acquisition, release, and stale-lock reclaim.
pub mod lock;
/// Bounded execution queue.
pub mod queue;
/// Periodic due-job checker.
pub mod checker;
/// Execution and notification collaborators.
pub mod collab;
/// Worker pool and retry policy.
pub mod worker;
/// Scheduler instance wiring.
pub mod scheduler;

pub use error::{LifecycleError, SchedulerError, StoreError};
pub use job::{Job, JobId, JobPatch, JobStatus, NewJob, Payload};
pub use jobstore::{JobStore, KvJobStore, SharedStore};
pub use scheduler::{Scheduler, SchedulerHandle};
