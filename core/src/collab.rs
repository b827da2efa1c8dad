//! Seams to the rest of the application: the thing that actually runs a job
//! (collect posts, build the report) and the thing that tells the owner.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::job::{JobId, Payload};

/// Outcome of a failed execution, as classified by the executor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecError {
    /// Worth retrying: timeout, rate limit, network.
    #[error("transient: {0}")]
    Transient(String),
    /// Will never succeed: malformed payload, permanent rejection.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ExecError {
    /// Retryable?
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecError::Transient(_))
    }
}

/// Runs one execution of a job.
#[async_trait]
pub trait JobExecutor: Send + Sync + 'static {
    /// Execute with the job's payload. The scheduler bounds this call with its
    /// own timeout and treats expiry as transient.
    async fn execute(&self, job_id: &str, payload: &Payload) -> Result<(), ExecError>;
}

/// What happened to a job, from the owner's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    /// A run succeeded and more are scheduled.
    RunSucceeded {
        /// Runs done so far.
        run: u32,
        /// Target.
        total: u32,
    },
    /// The last run succeeded.
    Completed {
        /// Runs done.
        total: u32,
    },
    /// The job ended in `failed`.
    Failed {
        /// Last error message.
        reason: String,
        /// Failure streak at the end.
        consecutive_failures: u32,
    },
}

/// Message to a job's owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Job concerned.
    pub job_id: JobId,
    /// Recipient.
    pub owner: String,
    /// Event.
    pub kind: NotificationKind,
}

/// Delivers notifications (push, mail, ...).
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    /// Deliver one notification.
    async fn notify(&self, note: &Notification) -> anyhow::Result<()>;
}

/// Notifier that only writes to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, note: &Notification) -> anyhow::Result<()> {
        info!(job = %note.job_id, owner = %note.owner, kind = ?note.kind, "notify");
        Ok(())
    }
}

/// Fire-and-forget delivery: runs detached, failures are logged and dropped.
pub fn dispatch(notifier: &Arc<dyn Notifier>, note: Notification) {
    let notifier = Arc::clone(notifier);
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&note).await {
            warn!(job = %note.job_id, owner = %note.owner, err = %e, "notification failed");
        }
    });
}
