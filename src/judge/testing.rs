use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};

use super::*;
use crate::sandbox::ExecutionResult;

/// Checker exit codes
mod checker_exit_codes {
    pub const OK: i32 = 0;
    pub const WRONG_ANSWER: i32 = 1;
    pub const PRESENTATION_ERROR: i32 = 2;
}

/// Result of a single test case execution
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TestCaseResult {
    pub status: Verdict,
    /// Wall-clock seconds of the submission run
    pub time: f64,
    /// Peak memory of the submission run in bytes
    pub memory: u64,
}

/// Transient files of one test case
#[derive(Debug)]
struct TestCasePaths {
    input: PathBuf,
    output: PathBuf,
    expected: PathBuf,
}

impl TestCasePaths {
    fn new(dir: &Path) -> Self {
        Self {
            input: dir.join("input.txt"),
            output: dir.join("output.txt"),
            expected: dir.join("expected.txt"),
        }
    }

    fn remove(&self) {
        for path in [&self.input, &self.output, &self.expected] {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("Failed to remove {}: {e}", path.display());
                }
            }
        }
    }
}

impl<R: SandboxRunner> Judge<R> {
    /// Runs the submission on one test case and classifies the outcome
    ///
    /// TLE and RE are decided from the run alone; otherwise the checker is
    /// invoked as `checker <input> <output> <expected>` and its exit code
    /// gives the verdict.
    pub async fn test_case(&self, input: &[u8], expected: &[u8]) -> Result<TestCaseResult> {
        ensure!(
            self.checker_ready && self.source_ready,
            "test_case called before checker and source were compiled successfully"
        );

        let paths = TestCasePaths::new(self.dir());
        fs::write(&paths.input, input).context("Failed to write test input")?;

        let result = self.verify(&paths, expected).await;
        paths.remove();
        result
    }

    async fn verify(&self, paths: &TestCasePaths, expected: &[u8]) -> Result<TestCaseResult> {
        let (source, artifact) = self.source_paths();
        let command = self
            .language
            .run_command(&source, &artifact, self.dir())?
            .stdin(&paths.input);
        let exec = self.runner.safe_run(&command, self.time_limit, true).await?;

        let mut result = TestCaseResult {
            status: Verdict::Accepted,
            time: exec.time,
            memory: exec.memory,
        };
        if exec.tle {
            result.status = Verdict::TimeLimitExceeded;
            return Ok(result);
        }
        if exec.return_code != 0 {
            log::debug!("Submission exited with code {}", exec.return_code);
            result.status = Verdict::RuntimeError;
            return Ok(result);
        }

        // The answer only appears once the submission can no longer read it
        fs::write(&paths.output, &exec.stdout).context("Failed to write submission output")?;
        fs::write(&paths.expected, expected).context("Failed to write expected output")?;

        let (checker_source, checker_artifact) = self.checker_paths();
        let mut checker = self.options.checker_language.run_command(
            &checker_source,
            &checker_artifact,
            self.dir(),
        )?;
        checker.args.extend(
            [&paths.input, &paths.output, &paths.expected]
                .iter()
                .map(|p| p.to_string_lossy().into_owned()),
        );
        let checked = self
            .runner
            .safe_run(&checker, self.options.checker_time_limit, true)
            .await?;

        result.status = checker_verdict(&checked);
        Ok(result)
    }
}

/// Maps the checker's exit status to a verdict
///
/// Anything but 0/1/2 is a checker malfunction, never the contestant's fault.
fn checker_verdict(exec: &ExecutionResult) -> Verdict {
    if exec.tle {
        log::error!("Checker exceeded its time limit");
        return Verdict::Fail;
    }
    match exec.return_code {
        checker_exit_codes::OK => Verdict::Accepted,
        checker_exit_codes::WRONG_ANSWER => Verdict::WrongAnswer,
        checker_exit_codes::PRESENTATION_ERROR => Verdict::PresentationError,
        code => {
            log::error!(
                "Checker exited with unrecognized code {code}: {}",
                String::from_utf8_lossy(&exec.stderr)
            );
            Verdict::Fail
        }
    }
}
