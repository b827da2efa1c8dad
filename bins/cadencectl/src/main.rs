use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use cadence_core::cfg::{self, AppId};
use cadence_core::{logx, store, Job, JobStatus, JobStore, KvJobStore, NewJob, Payload};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::debug;

// Shares the daemon's config and data dirs.
const APP: AppId = AppId {
    qualifier: "com",
    organization: "local",
    application: "cadence",
};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"), version, about = "Manage cadence jobs")]
struct Cli {
    /// Config file (default: the daemon's)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Job store directory override
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Log level (warn by default)
    #[arg(long, global = true)]
    log: Option<String>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Register a recurring analysis job; prints its id
    Create {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        keyword: String,
        /// Minutes between runs
        #[arg(long)]
        interval: u32,
        /// Number of runs
        #[arg(long)]
        runs: u32,
        /// First run (RFC 3339); now if omitted
        #[arg(long)]
        start: Option<DateTime<Utc>>,
        /// Notify the owner after every run
        #[arg(long)]
        notify: bool,
        /// Report option, repeatable: --opt length=long
        #[arg(long = "opt", value_parser = parse_opt)]
        opts: Vec<(String, String)>,
    },
    /// List jobs
    List {
        #[arg(long)]
        status: Option<JobStatus>,
        /// Emit JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Print one job as JSON
    Show { id: String },
    /// Stop scheduling a job until resumed
    Pause { id: String },
    /// Resume a paused job
    Resume { id: String },
    /// Cancel a job for good
    Cancel { id: String },
    /// Delete finished jobs not touched for N days
    Purge {
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
}

#[derive(Serialize)]
struct Row<'a> {
    id: &'a str,
    status: JobStatus,
    keyword: &'a str,
    runs: String,
    remaining: u32,
    interval_minutes: u32,
    next_due_at: Option<DateTime<Utc>>,
    locked: bool,
}

impl<'a> From<&'a Job> for Row<'a> {
    fn from(j: &'a Job) -> Self {
        Row {
            id: &j.id,
            status: j.status,
            keyword: &j.payload.keyword,
            runs: format!("{}/{}", j.completed_runs, j.total_runs),
            remaining: j.remaining_runs(),
            interval_minutes: j.interval_minutes,
            next_due_at: j.next_due_at,
            locked: j.locked,
        }
    }
}

fn parse_opt(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got {s:?}")),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logx::init(cli.log.as_deref().unwrap_or("warn"));

    let cfg = match &cli.config {
        Some(path) => cfg::load_or_init_at(path)?,
        None => cfg::load_or_init(&APP)?,
    };
    let dir = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => cfg::data_dir(&APP, &cfg)?,
    };
    debug!(data_dir = %dir.display(), "opening job store");
    let jobs = KvJobStore::new(store::open_default(&dir)?);
    let now = Utc::now();

    match cli.cmd {
        Cmd::Create { owner, keyword, interval, runs, start, notify, opts } => {
            let req = NewJob {
                owner,
                payload: Payload { keyword, options: opts.into_iter().collect::<BTreeMap<_, _>>() },
                interval_minutes: interval,
                total_runs: runs,
                start_at: start,
                notify,
            };
            let id = jobs.create(req, now)?;
            println!("{id}");
        }
        Cmd::List { status, json } => {
            for job in jobs.list()?.iter().filter(|j| status.map_or(true, |s| j.status == s)) {
                let row = Row::from(job);
                if json {
                    println!("{}", serde_json::to_string(&row)?);
                } else {
                    let next = row.next_due_at.map_or_else(|| "-".to_string(), |t| t.to_rfc3339());
                    let lock = if row.locked { " [running]" } else { "" };
                    println!(
                        "{}  {:<9}  {:>7}  every {}m  next={}  {}{}",
                        row.id, row.status, row.runs, row.interval_minutes, next, row.keyword, lock
                    );
                }
            }
        }
        Cmd::Show { id } => {
            let job = jobs.get(&id)?.with_context(|| format!("no job {id}"))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Cmd::Pause { id } => set(&jobs, &id, JobStatus::Paused, now)?,
        Cmd::Resume { id } => set(&jobs, &id, JobStatus::Active, now)?,
        Cmd::Cancel { id } => set(&jobs, &id, JobStatus::Cancelled, now)?,
        Cmd::Purge { days } => {
            if days < 0 {
                bail!("--days must be >= 0");
            }
            let cutoff = Duration::try_days(days)
                .and_then(|age| now.checked_sub_signed(age))
                .context("--days is out of range")?;
            let purged = jobs.purge_terminal(cutoff)?;
            println!("purged {purged}");
        }
    }
    Ok(())
}

fn set<K: store::Kv>(jobs: &KvJobStore<K>, id: &str, status: JobStatus, now: DateTime<Utc>) -> Result<()> {
    let job = jobs.set_status(id, status, now)?;
    println!("{} {}", job.id, job.status);
    Ok(())
}
