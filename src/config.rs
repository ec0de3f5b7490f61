use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow, ensure};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use crate::language::LanguageProfile;
use crate::lease::LEASE_TTL;

#[derive(Parser, Debug)]
#[command(name = "oj-worker", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<String>,

    /// Path to the shared SQLite database
    #[arg(long = "database", short = 'd')]
    pub database: Option<PathBuf>,

    /// Worker identity used for leases, defaults to <hostname>-<pid>
    #[arg(long = "name", short = 'n')]
    pub name: Option<String>,

    /// Number of concurrent worker loops in this process
    #[arg(long = "threads", short = 't', default_value_t = 1)]
    pub threads: u8,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Poll the task queue and judge submissions until interrupted
    Serve,
    /// Judge a single submission and exit
    RunOne {
        /// Submission id
        id: i64,
    },
}

impl CliArgs {
    /// Load the configuration from the specified file, or defaults without one
    pub fn to_config(&self) -> std::io::Result<Config> {
        let Some(path) = &self.config_path else {
            return Ok(Config::default());
        };
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| e.into())
    }

    pub fn worker_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", hostname(), std::process::id()))
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub worker: WorkerConfig,
    pub judge: JudgeConfig,
    pub languages: Vec<LanguageProfile>,
}

#[derive(Deserialize, Debug)]
#[serde(default)]
pub struct WorkerConfig {
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            heartbeat_interval_ms: 20_000,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Deserialize, Debug)]
#[serde(default)]
pub struct JudgeConfig {
    /// Parent directory of per-submission workspaces
    pub work_dir: Option<PathBuf>,
    /// Seconds
    pub compile_time_limit: f64,
    /// Seconds
    pub checker_time_limit: f64,
    /// Bytes kept from each output stream
    pub output_limit: usize,
    pub checker_language: String,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            work_dir: None,
            compile_time_limit: crate::judge::COMPILE_TIME_LIMIT,
            checker_time_limit: crate::judge::CHECKER_TIME_LIMIT,
            output_limit: crate::sandbox::DEFAULT_OUTPUT_LIMIT,
            checker_language: "cpp".to_string(),
        }
    }
}

impl JudgeConfig {
    /// Workspace parent, created on demand
    pub fn work_dir(&self) -> Result<PathBuf> {
        use directories::ProjectDirs;

        let dir = match &self.work_dir {
            Some(dir) => dir.clone(),
            None => ProjectDirs::from("", "", "oj-worker")
                .ok_or_else(|| anyhow!("Unable to find user directory"))?
                .cache_dir()
                .join("workspaces"),
        };
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.worker.heartbeat_interval() < LEASE_TTL,
            "heartbeat_interval_ms must be shorter than the {}s lease TTL",
            LEASE_TTL.as_secs()
        );
        ensure!(
            self.worker.heartbeat_interval_ms > 0,
            "heartbeat_interval_ms must be positive"
        );
        ensure!(
            self.judge.compile_time_limit > 0.0 && self.judge.checker_time_limit > 0.0,
            "time limits must be positive"
        );
        Ok(())
    }
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for its whole length
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if ret != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}
