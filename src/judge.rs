mod compile;
mod testing;

pub use compile::CompileResult;
pub use testing::TestCaseResult;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tempfile::TempDir;

use crate::language::{LanguageProfile, LanguageRegistry};
use crate::sandbox::{SandboxRunner, SimpleRunner};

/// Compilation wall-clock limit in seconds
pub const COMPILE_TIME_LIMIT: f64 = 30.0;
/// Checker wall-clock limit in seconds
pub const CHECKER_TIME_LIMIT: f64 = 10.0;

const CHECKER_NAME: &str = "checker";
const SOURCE_NAME: &str = "main";

/// Final classification of a test case or a whole submission
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    #[serde(rename = "AC")]
    Accepted,
    #[serde(rename = "WA")]
    WrongAnswer,
    #[serde(rename = "PE")]
    PresentationError,
    #[serde(rename = "TLE")]
    TimeLimitExceeded,
    #[serde(rename = "RE")]
    RuntimeError,
    #[serde(rename = "CE")]
    CompileError,
    /// Judge-side malfunction: broken checker or problem setup
    Fail,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accepted => "AC",
            Verdict::WrongAnswer => "WA",
            Verdict::PresentationError => "PE",
            Verdict::TimeLimitExceeded => "TLE",
            Verdict::RuntimeError => "RE",
            Verdict::CompileError => "CE",
            Verdict::Fail => "Fail",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "AC" => Verdict::Accepted,
            "WA" => Verdict::WrongAnswer,
            "PE" => Verdict::PresentationError,
            "TLE" => Verdict::TimeLimitExceeded,
            "RE" => Verdict::RuntimeError,
            "CE" => Verdict::CompileError,
            "Fail" => Verdict::Fail,
            _ => return Err(anyhow!("Unknown verdict: {s}")),
        })
    }
}

/// Lifecycle of a submission
///
/// `Queued -> Compiling -> Running -> Finished(_)`, with compile failures
/// going straight from `Compiling` to `Finished(CE | Fail)`. Only the
/// finished states survive the lease that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Queued,
    Compiling,
    Running,
    Finished(Verdict),
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Queued => "Queued",
            Status::Compiling => "Compiling",
            Status::Running => "Running",
            Status::Finished(verdict) => verdict.as_str(),
        }
    }
}

impl FromStr for Status {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "Queued" => Status::Queued,
            "Compiling" => Status::Compiling,
            "Running" => Status::Running,
            other => Status::Finished(other.parse()?),
        })
    }
}

/// One named (input, expected output) pair of a testdata set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub name: String,
    pub input: Vec<u8>,
    pub expected: Vec<u8>,
}

/// Result of one executed test case, tagged with the case name
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct CaseResult {
    pub name: String,
    pub status: Verdict,
    pub time: f64,
    pub memory: u64,
}

/// Aggregates test case results in declared order
///
/// The first non-AC result decides the verdict and ends judging; worst time
/// and memory only cover the cases that actually ran.
#[derive(Debug, Clone, Default)]
pub struct Summary {
    cases: Vec<CaseResult>,
    max_time: f64,
    max_memory: u64,
    failure: Option<Verdict>,
}

impl Summary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one result; returns whether the next case should be run
    pub fn record(&mut self, name: &str, result: &TestCaseResult) -> bool {
        debug_assert!(self.failure.is_none(), "recorded a case after a failure");
        self.max_time = self.max_time.max(result.time);
        self.max_memory = self.max_memory.max(result.memory);
        self.cases.push(CaseResult {
            name: name.to_string(),
            status: result.status,
            time: result.time,
            memory: result.memory,
        });
        if result.status != Verdict::Accepted {
            self.failure = Some(result.status);
        }
        self.failure.is_none()
    }

    /// Verdict of the first failing case, AC when all recorded cases passed
    pub fn verdict(&self) -> Verdict {
        self.failure.unwrap_or(Verdict::Accepted)
    }

    pub fn cases(&self) -> &[CaseResult] {
        &self.cases
    }

    pub fn max_time(&self) -> f64 {
        self.max_time
    }

    pub fn max_memory(&self) -> u64 {
        self.max_memory
    }
}

/// Limits and the checker toolchain shared by every Judge of a worker
#[derive(Debug, Clone)]
pub struct JudgeOptions {
    pub compile_time_limit: f64,
    pub checker_time_limit: f64,
    pub checker_language: LanguageProfile,
}

impl Default for JudgeOptions {
    fn default() -> Self {
        Self {
            compile_time_limit: COMPILE_TIME_LIMIT,
            checker_time_limit: CHECKER_TIME_LIMIT,
            checker_language: LanguageRegistry::builtin()
                .get("cpp")
                .cloned()
                .expect("built-in registry always has cpp"),
        }
    }
}

/// Compiles and tests one submission inside a private workspace
///
/// Both [`Judge::compile_checker`] and [`Judge::compile_source`] must succeed
/// before [`Judge::test_case`] may be called. The workspace directory and
/// everything in it is removed when the Judge is dropped.
pub struct Judge<R: SandboxRunner = SimpleRunner> {
    runner: R,
    options: JudgeOptions,
    dir: TempDir,
    language: LanguageProfile,
    checker_source: String,
    source: String,
    time_limit: f64,
    checker_ready: bool,
    source_ready: bool,
}

impl Judge {
    /// Creates a fresh workspace under `work_root` for one submission
    pub fn new(
        work_root: impl AsRef<Path>,
        language: &LanguageProfile,
        checker_source: &str,
        source: &str,
        time_limit: f64,
    ) -> Result<Self> {
        let work_root = work_root.as_ref();
        let dir = tempfile::Builder::new()
            .prefix("judge-")
            .tempdir_in(work_root)
            .with_context(|| format!("Failed to create workspace in {}", work_root.display()))?;
        log::debug!("Created workspace {}", dir.path().display());

        Ok(Self {
            runner: SimpleRunner::default(),
            options: JudgeOptions::default(),
            dir,
            language: language.clone(),
            checker_source: checker_source.to_string(),
            source: source.to_string(),
            time_limit,
            checker_ready: false,
            source_ready: false,
        })
    }
}

impl<R: SandboxRunner> Judge<R> {
    pub fn with_options(mut self, options: JudgeOptions) -> Self {
        self.options = options;
        self
    }

    /// Swaps the process runner, e.g. for a hardened sandbox
    pub fn with_runner<S: SandboxRunner>(self, runner: S) -> Judge<S> {
        Judge {
            runner,
            options: self.options,
            dir: self.dir,
            language: self.language,
            checker_source: self.checker_source,
            source: self.source,
            time_limit: self.time_limit,
            checker_ready: self.checker_ready,
            source_ready: self.source_ready,
        }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Removes the workspace, reporting failures instead of ignoring them
    pub fn close(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir
            .close()
            .with_context(|| format!("Failed to remove workspace {}", path.display()))
    }

    fn checker_paths(&self) -> (PathBuf, PathBuf) {
        let ext = self.options.checker_language.extension();
        (
            self.dir().join(format!("{CHECKER_NAME}.{ext}")),
            self.dir().join(CHECKER_NAME),
        )
    }

    fn source_paths(&self) -> (PathBuf, PathBuf) {
        (
            self.dir().join(&self.language.source),
            self.dir().join(SOURCE_NAME),
        )
    }
}
