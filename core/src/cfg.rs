use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::worker::RetryPolicy;

/// Identifier used to compute per-app configuration directories.
#[derive(Clone, Copy)]
pub struct AppId {
    /// Reverse-DNS style qualifier, e.g. `"com"`.
    pub qualifier: &'static str,
    /// Organization or vendor name, e.g. `"local"`.
    pub organization: &'static str,
    /// Application name, e.g. `"cadence"`.
    pub application: &'static str,
}

/// Longest duration any `*_secs` setting may hold (ten years).
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Application configuration persisted to `config.toml`. Missing fields and
/// tables take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tracing level to use if `RUST_LOG` is not set (e.g. `"info"`).
    pub log_level: String,
    /// Job store directory; defaults to the per-app data dir.
    pub data_dir: Option<PathBuf>,
    /// Checker/worker tuning.
    pub scheduler: SchedulerConfig,
    /// External command the daemon runs per job.
    pub executor: ExecutorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            data_dir: None,
            scheduler: SchedulerConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

/// `[scheduler]` table. Durations are whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Checker period.
    pub tick_secs: u64,
    /// Max candidates examined per tick.
    pub page_size: usize,
    /// Execution queue capacity.
    pub queue_capacity: usize,
    /// Concurrent workers.
    pub workers: usize,
    /// Locks older than this are reclaimed.
    pub max_execution_secs: u64,
    /// Per-run executor timeout; expiry is a transient failure.
    pub exec_timeout_secs: u64,
    /// Transient failures in a row before the job fails.
    pub max_consecutive_failures: u32,
    /// First retry delay; doubles per further failure.
    pub backoff_base_secs: u64,
    /// Retry delay ceiling.
    pub backoff_cap_secs: u64,
    /// Notify on every success, not only for jobs that opted in.
    pub notify_on_success: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 60,
            page_size: 50,
            queue_capacity: 32,
            workers: 2,
            max_execution_secs: 1800,
            exec_timeout_secs: 600,
            max_consecutive_failures: 3,
            backoff_base_secs: 30,
            backoff_cap_secs: 1800,
            notify_on_success: false,
        }
    }
}

impl SchedulerConfig {
    /// Checker period.
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    /// Stale-lock window.
    pub fn max_execution(&self) -> chrono::Duration {
        chrono_secs(self.max_execution_secs)
    }

    /// Executor timeout.
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    /// Retry settings for the workers.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_consecutive_failures: self.max_consecutive_failures,
            backoff_base: chrono_secs(self.backoff_base_secs),
            backoff_cap: chrono_secs(self.backoff_cap_secs),
        }
    }

    /// Reject settings the control loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_secs == 0 {
            return Err(ConfigError("tick_secs must be > 0".into()));
        }
        if self.page_size == 0 || self.queue_capacity == 0 || self.workers == 0 {
            return Err(ConfigError("page_size, queue_capacity and workers must be > 0".into()));
        }
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError("max_consecutive_failures must be > 0".into()));
        }
        if self.max_execution_secs <= self.exec_timeout_secs {
            // Otherwise a run still inside its timeout could be reclaimed.
            return Err(ConfigError("max_execution_secs must exceed exec_timeout_secs".into()));
        }
        if self.backoff_cap_secs < self.backoff_base_secs {
            return Err(ConfigError("backoff_cap_secs must be >= backoff_base_secs".into()));
        }
        let longest = [self.tick_secs, self.max_execution_secs, self.exec_timeout_secs, self.backoff_cap_secs]
            .into_iter()
            .max()
            .unwrap_or_default();
        if longest > MAX_DURATION_SECS {
            return Err(ConfigError(format!("durations must be at most {MAX_DURATION_SECS} seconds")));
        }
        Ok(())
    }
}

// Clamped so an unvalidated config can never overflow chrono's range.
fn chrono_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

/// `[executor]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Program to run per job.
    pub cmd: Option<String>,
    /// Arguments.
    pub args: Vec<String>,
}

fn project_dirs(app: &AppId) -> Result<ProjectDirs> {
    ProjectDirs::from(app.qualifier, app.organization, app.application)
        .ok_or_else(|| anyhow::anyhow!("failed to resolve ProjectDirs"))
}

/// Return the configuration directory for this app, creating it if needed.
pub fn config_dir(app: &AppId) -> Result<PathBuf> {
    let dir = project_dirs(app)?.config_dir().to_path_buf();
    fs::create_dir_all(&dir).with_context(|| format!("create config dir {}", dir.display()))?;
    Ok(dir)
}

/// Job store directory: `cfg.data_dir` if set, else the per-app data dir.
pub fn data_dir(app: &AppId, cfg: &Config) -> Result<PathBuf> {
    match &cfg.data_dir {
        Some(dir) => Ok(dir.clone()),
        None => Ok(project_dirs(app)?.data_dir().join("jobs")),
    }
}

/// Load `config.toml` from the app config dir or create a default one.
pub fn load_or_init(app: &AppId) -> Result<Config> {
    load_or_init_at(&config_dir(app)?.join("config.toml"))
}

/// Load the config at `path`, writing defaults there first if it is missing.
pub fn load_or_init_at(path: &Path) -> Result<Config> {
    if path.exists() {
        let txt = fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&txt)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(cfg)
    } else {
        let cfg = Config::default();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        save_config(path, &cfg)?;
        Ok(cfg)
    }
}

fn save_config(path: &Path, cfg: &Config) -> Result<()> {
    let s = toml::to_string_pretty(cfg)?;
    fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_tables_fall_back_to_defaults() {
        let cfg: Config = toml::from_str("log_level = \"debug\"\n[scheduler]\nworkers = 4\n").unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.scheduler.workers, 4);
        assert_eq!(cfg.scheduler.max_consecutive_failures, 3);
        assert_eq!(cfg.executor, ExecutorConfig::default());
    }

    #[test]
    fn log_level_may_be_omitted() {
        let cfg: Config = toml::from_str("[scheduler]\nworkers = 4\n").unwrap();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.data_dir, None);
        assert_eq!(cfg.scheduler.workers, 4);

        let empty: Config = toml::from_str("").unwrap();
        assert_eq!(empty.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn huge_durations_are_rejected_not_panicking() {
        let cfg = SchedulerConfig { max_execution_secs: u64::MAX, backoff_cap_secs: u64::MAX, ..Default::default() };
        assert!(cfg.validate().is_err());
        assert_eq!(cfg.max_execution(), chrono::Duration::seconds(MAX_DURATION_SECS as i64));
        assert_eq!(cfg.retry_policy().backoff_cap, chrono::Duration::seconds(MAX_DURATION_SECS as i64));
    }

    #[test]
    fn defaults_are_valid() {
        SchedulerConfig::default().validate().unwrap();
    }

    #[test]
    fn stale_window_must_exceed_timeout() {
        let cfg = SchedulerConfig { max_execution_secs: 600, exec_timeout_secs: 600, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn init_writes_then_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let first = load_or_init_at(&path).unwrap();
        assert!(path.exists());
        let second = load_or_init_at(&path).unwrap();
        assert_eq!(first.scheduler, second.scheduler);
    }
}
