use cadence_core::SharedStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// What every long-running piece of the daemon gets at startup.
#[derive(Clone)]
pub struct ModuleCtx {
    pub store: SharedStore,
    pub shutdown: watch::Receiver<bool>,
}

impl ModuleCtx {
    /// Resolves once shutdown has been requested or the sender is gone.
    pub async fn stopped(&mut self) {
        while !*self.shutdown.borrow() {
            if self.shutdown.changed().await.is_err() {
                return;
            }
        }
    }
}

pub trait Module: Send + 'static {
    fn name(&self) -> &'static str;
    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>>;
}

/// Spawned modules, joined together on shutdown.
pub struct Running {
    tasks: Vec<(&'static str, JoinHandle<anyhow::Result<()>>)>,
}

impl Running {
    pub fn start(modules: Vec<Box<dyn Module>>, ctx: &ModuleCtx) -> Self {
        let tasks = modules
            .into_iter()
            .map(|m| {
                let name = m.name();
                info!(module = name, "starting");
                (name, m.spawn(ctx.clone()))
            })
            .collect();
        Self { tasks }
    }

    /// Wait for every module; returns how many ended in error.
    pub async fn join(self) -> usize {
        let mut failed = 0;
        for (name, h) in self.tasks {
            match h.await {
                Ok(Ok(())) => info!(module = name, "stopped"),
                Ok(Err(e)) => {
                    failed += 1;
                    error!(module = name, err = %e, "module failed");
                }
                Err(e) => {
                    failed += 1;
                    error!(module = name, err = %e, "module panicked");
                }
            }
        }
        failed
    }
}
