use cadence_core::Scheduler;
use tracing::info;

use crate::module::{Module, ModuleCtx};

/// Hosts one scheduler instance until the daemon shuts down.
pub struct SchedulerModule {
    sched: Scheduler,
}

impl SchedulerModule {
    pub fn new(sched: Scheduler) -> Self {
        Self { sched }
    }
}

impl Module for SchedulerModule {
    fn name(&self) -> &'static str { "scheduler" }

    fn spawn(self: Box<Self>, mut ctx: ModuleCtx) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let jobs = ctx.store.list()?;
            let active = jobs.iter().filter(|j| !j.status.is_terminal()).count();
            let stuck = jobs.iter().filter(|j| j.locked).count();
            info!(jobs = jobs.len(), active, locked = stuck, "job store loaded");

            let handle = self.sched.spawn()?;
            ctx.stopped().await;
            info!("scheduler stopping");
            let released = handle.shutdown().await;
            info!(released, "scheduler stopped");
            Ok(())
        })
    }
}
