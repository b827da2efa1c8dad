use std::process::Stdio;

use async_trait::async_trait;
use cadence_core::collab::{ExecError, JobExecutor};
use cadence_core::Payload;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// `sysexits.h` EX_TEMPFAIL: the command asks to be retried later.
pub const EX_TEMPFAIL: i32 = 75;

/// Runs one external command per job execution.
///
/// The payload goes to stdin as JSON and the job id to `CADENCE_JOB_ID`.
/// Exit 0 is success, [`EX_TEMPFAIL`] or death by signal is transient, any
/// other exit is fatal. The child is killed if the run is abandoned (timeout).
pub struct CommandExecutor {
    cmd: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(cmd: impl Into<String>, args: Vec<String>) -> Self {
        Self { cmd: cmd.into(), args }
    }
}

#[async_trait]
impl JobExecutor for CommandExecutor {
    async fn execute(&self, job_id: &str, payload: &Payload) -> Result<(), ExecError> {
        let body = serde_json::to_vec(payload).map_err(|e| ExecError::Fatal(format!("encode payload: {e}")))?;

        let mut child = Command::new(&self.cmd)
            .args(&self.args)
            .env("CADENCE_JOB_ID", job_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::Transient(format!("spawn {}: {e}", self.cmd)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that ignores its input may exit before reading it all.
            if let Err(e) = stdin.write_all(&body).await {
                debug!(job = job_id, err = %e, "payload not fully consumed");
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| ExecError::Transient(format!("wait {}: {e}", self.cmd)))?;
        classify(status.code())
    }
}

fn classify(code: Option<i32>) -> Result<(), ExecError> {
    match code {
        Some(0) => Ok(()),
        Some(EX_TEMPFAIL) => Err(ExecError::Transient(format!("exit status {EX_TEMPFAIL}"))),
        Some(c) => Err(ExecError::Fatal(format!("exit status {c}"))),
        None => Err(ExecError::Transient("terminated by signal".into())),
    }
}
