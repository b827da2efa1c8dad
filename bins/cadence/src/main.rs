mod module;
mod runner;
mod scheduler;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use cadence_core::cfg::{self, AppId, Config};
use cadence_core::{logx, store, KvJobStore, Scheduler, SharedStore};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use crate::module::{Module, ModuleCtx, Running};
use crate::runner::CommandExecutor;
use crate::scheduler::SchedulerModule;

const APP: AppId = AppId {
    qualifier: "com",
    organization: "local",
    application: env!("CARGO_PKG_NAME"),
};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"), version, about = "Recurring analysis job scheduler")]
struct Cli {
    /// Config file (default: per-app config dir)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Job store directory override
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Log level override (info,debug,trace)
    #[arg(long)]
    log: Option<String>,
    /// Run a single check, execute what is due, and exit
    #[arg(long)]
    once: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => cfg::load_or_init_at(path)?,
        None => cfg::load_or_init(&APP)?,
    };
    logx::init(cli.log.as_deref().unwrap_or(&cfg.log_level));

    runtime()?.block_on(run(cli, cfg))
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    let mut b = if cfg!(feature = "rt-single") {
        tokio::runtime::Builder::new_current_thread()
    } else {
        let mut b = tokio::runtime::Builder::new_multi_thread();
        b.worker_threads(num_cpus::get().clamp(1, 4));
        b
    };
    b.enable_all().build().context("build tokio runtime")
}

async fn run(cli: Cli, cfg: Config) -> Result<()> {
    let dir = match cli.data_dir {
        Some(dir) => dir,
        None => cfg::data_dir(&APP, &cfg)?,
    };
    let store: SharedStore = Arc::new(KvJobStore::new(store::open_default(&dir)?));
    info!("{} boot data_dir={}", APP.application, dir.display());

    let cmd = cfg
        .executor
        .cmd
        .clone()
        .context("executor.cmd is not set in config.toml")?;
    let executor = Arc::new(CommandExecutor::new(cmd, cfg.executor.args.clone()));
    let sched = Scheduler::new(store.clone(), executor, cfg.scheduler.clone());

    if cli.once {
        let report = sched.run_once().await?;
        info!(
            scanned = report.tick.scanned,
            executed = report.runs.len(),
            errors = report.errors,
            "single pass done"
        );
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = ModuleCtx { store, shutdown: shutdown_rx };
    let modules: Vec<Box<dyn Module>> = vec![Box::new(SchedulerModule::new(sched))];
    let running = Running::start(modules, &ctx);

    wait_for_signal().await;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    match running.join().await {
        0 => Ok(()),
        n => anyhow::bail!("{n} module(s) stopped with errors"),
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            error!(err = %e, "SIGTERM handler unavailable; waiting for ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
