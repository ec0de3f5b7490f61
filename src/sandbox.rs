mod output;
mod runner;
mod simple_runner;

pub use output::OutputCapture;
pub use runner::SandboxRunner;
pub use simple_runner::SimpleRunner;

use std::path::{Path, PathBuf};

/// Default cap on captured stdout/stderr of a single process
pub const DEFAULT_OUTPUT_LIMIT: usize = 64 * 1024 * 1024;

/// A fully specified external command: program, arguments, working directory
/// and the file (if any) fed to standard input.
#[derive(Debug, Clone)]
pub struct RunCommand {
    pub program: String,
    pub args: Vec<String>,
    pub dir: PathBuf,
    pub stdin: Option<PathBuf>,
}

impl RunCommand {
    /// Builds a command from an argv-style vector, the first element being the program
    pub fn from_argv(argv: &[String], dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("Empty command"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            dir: dir.as_ref().to_path_buf(),
            stdin: None,
        })
    }

    pub fn stdin(mut self, path: impl AsRef<Path>) -> Self {
        self.stdin = Some(path.as_ref().to_path_buf());
        self
    }
}

/// Outcome of one process invocation
///
/// `return_code` is meaningless when `tle` is set. Processes killed by a
/// signal report `128 + signal`.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub return_code: i32,
    /// Wall-clock seconds
    pub time: f64,
    /// Peak resident memory in bytes, 0 when it could not be sampled
    pub memory: u64,
    pub tle: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        !self.tle && self.return_code == 0
    }
}

/// The command could not be started at all (missing binary, permission
/// denied, bad working directory). A non-zero exit is never a launch error.
#[derive(Debug, thiserror::Error)]
#[error("failed to launch `{program}`: {source}")]
pub struct LaunchError {
    pub program: String,
    #[source]
    pub source: std::io::Error,
}
