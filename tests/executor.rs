use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use oj_worker::sandbox::{LaunchError, RunCommand, SandboxRunner, SimpleRunner};

fn command(argv: &[&str], dir: &std::path::Path) -> RunCommand {
    let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
    RunCommand::from_argv(&argv, dir).unwrap()
}

#[tokio::test]
async fn test_quick_command_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let result = SimpleRunner::default()
        .safe_run(&command(&["sh", "-c", "printf hello"], dir.path()), 5.0, true)
        .await
        .unwrap();

    assert!(result.success());
    assert!(!result.tle);
    assert_eq!(result.stdout, b"hello");
    assert!(result.time < 5.0);
}

#[tokio::test]
async fn test_exit_code_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let result = SimpleRunner::default()
        .safe_run(
            &command(&["sh", "-c", "echo oops >&2; exit 3"], dir.path()),
            5.0,
            true,
        )
        .await
        .unwrap();

    assert_eq!(result.return_code, 3);
    assert!(!result.tle);
    assert_eq!(result.stderr, b"oops\n");
}

#[tokio::test]
async fn test_killed_by_signal() {
    let dir = tempfile::tempdir().unwrap();
    let result = SimpleRunner::default()
        .safe_run(&command(&["sh", "-c", "kill -9 $$"], dir.path()), 5.0, true)
        .await
        .unwrap();

    assert_eq!(result.return_code, 128 + libc::SIGKILL);
    assert!(!result.tle);
}

#[tokio::test]
async fn test_deadline_kills_process() {
    let dir = tempfile::tempdir().unwrap();
    let started = Instant::now();
    let result = SimpleRunner::default()
        .safe_run(&command(&["sleep", "5"], dir.path()), 1.0, false)
        .await
        .unwrap();

    assert!(result.tle);
    assert_eq!(result.return_code, -1);
    assert!(
        (0.9..=1.2).contains(&result.time),
        "time was {}",
        result.time
    );
    assert!(started.elapsed().as_secs_f64() < 3.0);
}

#[tokio::test]
async fn test_deadline_kills_descendants() {
    let dir = tempfile::tempdir().unwrap();
    let started = Instant::now();
    // The background sleep keeps stdout open; the run only ends if it dies too
    let result = SimpleRunner::default()
        .safe_run(
            &command(&["sh", "-c", "sleep 30 & echo started; wait"], dir.path()),
            0.5,
            true,
        )
        .await
        .unwrap();

    assert!(result.tle);
    assert_eq!(result.stdout, b"started\n");
    assert!(started.elapsed().as_secs_f64() < 3.0);
}

#[tokio::test]
async fn test_stdin_is_wired_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.txt");
    std::fs::write(&input, "1 2\n3 4\n").unwrap();

    let result = SimpleRunner::default()
        .safe_run(&command(&["cat"], dir.path()).stdin(&input), 5.0, true)
        .await
        .unwrap();

    assert!(result.success());
    assert_eq!(result.stdout, b"1 2\n3 4\n");
}

#[tokio::test]
async fn test_runs_in_given_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("marker"), "here").unwrap();

    let result = SimpleRunner::default()
        .safe_run(&command(&["cat", "marker"], dir.path()), 5.0, true)
        .await
        .unwrap();

    assert_eq!(result.stdout, b"here");
}

#[tokio::test]
async fn test_output_is_capped() {
    let dir = tempfile::tempdir().unwrap();
    let result = SimpleRunner::new(100)
        .safe_run(
            &command(&["head", "-c", "1000000", "/dev/zero"], dir.path()),
            5.0,
            true,
        )
        .await
        .unwrap();

    // The program is never blocked by a full pipe
    assert!(result.success());
    assert_eq!(result.stdout.len(), 100);
}

#[tokio::test]
async fn test_missing_program_is_a_launch_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = SimpleRunner::default()
        .safe_run(
            &command(&["/nonexistent/oj-worker-binary"], dir.path()),
            1.0,
            true,
        )
        .await
        .unwrap_err();

    let launch = err.downcast_ref::<LaunchError>().expect("not a LaunchError");
    assert_eq!(launch.program, "/nonexistent/oj-worker-binary");
}

#[tokio::test]
async fn test_missing_stdin_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let cmd = command(&["cat"], dir.path()).stdin(dir.path().join("absent.txt"));
    assert!(SimpleRunner::default().safe_run(&cmd, 1.0, true).await.is_err());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_memory_is_sampled() {
    let dir = tempfile::tempdir().unwrap();
    let result = SimpleRunner::default()
        .safe_run(&command(&["sleep", "0.2"], dir.path()), 5.0, false)
        .await
        .unwrap();

    assert!(result.success());
    assert!(result.memory > 0);
}

/// Whether `pid` is a live (non-zombie) process
#[cfg(target_os = "linux")]
fn is_running(pid: i32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next())
        .is_some_and(|state| state != 'Z')
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_cancelled_run_kills_descendants() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("background.pid");
    let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());

    let runner = SimpleRunner::default();
    let cmd = command(&["sh", "-c", script.as_str()], dir.path());
    let run = runner.safe_run(&cmd, 10.0, true);
    // Dropping the future mid-run, as a lost lease does
    assert!(
        tokio::time::timeout(Duration::from_millis(300), run)
            .await
            .is_err()
    );

    let pid: i32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while is_running(pid) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!is_running(pid), "background process {pid} survived");
}
