use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep, timeout};

use super::{
    DEFAULT_OUTPUT_LIMIT, ExecutionResult, LaunchError, OutputCapture, RunCommand, SandboxRunner,
};

const READ_CHUNK_SIZE: usize = 8192;
const MEMORY_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Upper bound on cleanup work after the process ends or is killed
const REAP_GRACE: Duration = Duration::from_millis(500);

/// A simple runner that executes processes without sandboxing
///
/// SimpleRunner provides the portable part of the execution contract only:
/// a wall-clock deadline enforced on the whole process group, bounded output
/// capture and best-effort peak memory sampling. There are no file system,
/// permission or syscall restrictions, so it is meant for trusted or already
/// isolated environments (containers, VMs).
#[derive(Debug, Clone)]
pub struct SimpleRunner {
    /// Byte cap applied to each captured stream
    output_limit: usize,
}

impl SimpleRunner {
    pub fn new(output_limit: usize) -> Self {
        Self { output_limit }
    }
}

impl Default for SimpleRunner {
    fn default() -> Self {
        Self::new(DEFAULT_OUTPUT_LIMIT)
    }
}

impl SandboxRunner for SimpleRunner {
    async fn safe_run(
        &self,
        command: &RunCommand,
        time_limit: f64,
        capture_output: bool,
    ) -> Result<ExecutionResult> {
        let limit = Duration::from_secs_f64(time_limit.max(0.0));

        let stdin = match &command.stdin {
            Some(path) => Stdio::from(
                tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("Failed to open stdin file {}", path.display()))?
                    .into_std()
                    .await,
            ),
            None => Stdio::null(),
        };
        let stdout = if capture_output {
            Stdio::piped()
        } else {
            Stdio::inherit()
        };

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&command.dir)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        log::debug!(
            "Running {} {:?} in {} (limit {time_limit}s)",
            command.program,
            command.args,
            command.dir.display()
        );

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| LaunchError {
            program: command.program.clone(),
            source,
        })?;
        let pid = child.id();
        // The child leads its own group, so its pid is the pgid
        let mut group = ProcessGroup(pid);

        let stdout_reader = child
            .stdout
            .take()
            .map(|s| tokio::spawn(drain(s, self.output_limit)));
        let stderr_reader = child
            .stderr
            .take()
            .map(|s| tokio::spawn(drain(s, self.output_limit)));

        let deadline = sleep(limit);
        tokio::pin!(deadline);
        let mut ticker = interval(MEMORY_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut memory = 0;

        // Whichever comes first, exit or deadline, decides the outcome
        let status = loop {
            tokio::select! {
                biased;
                status = child.wait() => {
                    break Some(status.context("Failed to wait for process")?);
                }
                _ = &mut deadline => break None,
                _ = ticker.tick() => {
                    if let Some(peak) = pid.and_then(peak_memory) {
                        memory = memory.max(peak);
                    }
                }
            }
        };
        let elapsed = start.elapsed();

        // Descendants may still be alive either way
        group.kill();
        if status.is_none() {
            let _ = child.start_kill();
            if timeout(REAP_GRACE, child.wait()).await.is_err() {
                log::warn!("Process {pid:?} was not reaped within the grace period");
            }
        }

        let stdout = collect(stdout_reader).await;
        let stderr = collect(stderr_reader).await;

        let result = match status {
            Some(status) => ExecutionResult {
                return_code: status
                    .code()
                    .unwrap_or_else(|| 128 + status.signal().unwrap_or(0)),
                time: elapsed.as_secs_f64(),
                memory,
                tle: false,
                stdout,
                stderr,
            },
            None => ExecutionResult {
                return_code: -1,
                time: elapsed.as_secs_f64(),
                memory,
                tle: true,
                stdout,
                stderr,
            },
        };

        log::debug!(
            "{} finished: code={} time={:.3}s tle={}",
            command.program,
            result.return_code,
            result.time,
            result.tle
        );
        Ok(result)
    }
}

/// Reads a stream to the end through a bounded capture
async fn drain(mut stream: impl AsyncRead + Unpin + Send + 'static, limit: usize) -> OutputCapture {
    let mut capture = OutputCapture::new(limit);
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                capture.write(&buf[..n]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!("Output stream closed with error: {e}");
                break;
            }
        }
    }
    capture
}

/// Waits for a reader task, giving up after the grace period
async fn collect(reader: Option<JoinHandle<OutputCapture>>) -> Vec<u8> {
    let Some(mut handle) = reader else {
        return Vec::new();
    };
    match timeout(REAP_GRACE, &mut handle).await {
        Ok(Ok(capture)) => {
            if capture.truncated() {
                log::debug!("Output truncated: {} bytes produced", capture.total());
            }
            capture.into_bytes()
        }
        Ok(Err(e)) => {
            log::warn!("Output reader task failed: {e}");
            Vec::new()
        }
        Err(_) => {
            handle.abort();
            log::warn!("Output stream still open after the grace period, abandoned");
            Vec::new()
        }
    }
}

/// Kills the whole process group at the latest when dropped, which covers
/// a cancelled `safe_run` future as well as every early return
struct ProcessGroup(Option<u32>);

impl ProcessGroup {
    fn kill(&mut self) {
        if let Some(pgid) = self.0.take() {
            kill_process_group(pgid);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

fn kill_process_group(pgid: u32) {
    // SAFETY: killpg has no memory safety preconditions; ESRCH just means the group is gone
    let ret = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            log::warn!("Failed to kill process group {pgid}: {err}");
        }
    }
}

/// Peak resident set size of a live process in bytes
#[cfg(target_os = "linux")]
fn peak_memory(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmHWM:"))
        .and_then(|value| value.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

#[cfg(not(target_os = "linux"))]
fn peak_memory(_pid: u32) -> Option<u64> {
    None
}
