use std::future::Future;

use anyhow::Result;

use super::{ExecutionResult, RunCommand};

/// Trait for different process execution implementations
///
/// The contract every implementation honors: one process per call, a
/// wall-clock deadline after which the process and all of its descendants are
/// killed, and bounded output capture. Hardened sandboxes (namespaces,
/// cgroups, seccomp) plug in here without touching the judge.
pub trait SandboxRunner: Send + Sync {
    /// Runs `command` for at most `time_limit` seconds
    ///
    /// With `capture_output` set, stdout is collected into the result;
    /// otherwise it is passed through to the worker's own stdout. Stderr is
    /// always collected. Fails with a [`super::LaunchError`] only when the
    /// process cannot be started.
    fn safe_run(
        &self,
        command: &RunCommand,
        time_limit: f64,
        capture_output: bool,
    ) -> impl Future<Output = Result<ExecutionResult>> + Send;
}
