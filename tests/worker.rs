mod common;

use std::time::Duration;

use pretty_assertions::assert_eq;
use sqlx::SqlitePool;
use tempfile::TempDir;

use common::{fixture, require};
use oj_worker::config::Config;
use oj_worker::database as db;
use oj_worker::judge::Verdict;
use oj_worker::lease::LeaseManager;
use oj_worker::worker::{WorkerContext, WorkerError, poll_once, run_one};

struct TestEnv {
    ctx: WorkerContext,
    _db_dir: TempDir,
    work_dir: TempDir,
}

async fn setup(time_limit: f64) -> TestEnv {
    let (pool, db_dir) = common::create_test_db().await;
    common::seed_problem(&pool, time_limit).await;
    env_with(pool, db_dir)
}

fn env_with(pool: SqlitePool, db_dir: TempDir) -> TestEnv {
    let work_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.judge.work_dir = Some(work_dir.path().to_path_buf());
    let ctx = WorkerContext::from_config(&config, pool).unwrap();
    TestEnv {
        ctx,
        _db_dir: db_dir,
        work_dir,
    }
}

fn statuses(results: &[db::StoredCaseResult]) -> Vec<(&str, &str)> {
    results
        .iter()
        .map(|r| (r.testcase.as_str(), r.status.as_str()))
        .collect()
}

#[tokio::test]
async fn test_run_one_accepted() {
    require!("g++");
    let env = setup(2.0).await;
    let pool = &env.ctx.pool;
    let id = common::submit(pool, "cpp", &fixture("ac.cpp")).await;
    db::push_task(id, 0, pool).await.unwrap();

    let verdict = run_one(&env.ctx, id, "w1").await.unwrap();
    assert_eq!(verdict, Verdict::Accepted);

    let submission = db::fetch_submission(id, pool).await.unwrap();
    assert_eq!(submission.status, "AC");
    assert_eq!(submission.judge_name, "w1");
    assert_eq!(submission.judge_ping, None);
    assert!(!submission.judge_tasked);
    assert!(submission.max_time < 2000);

    let results = db::fetch_testcase_results(id, pool).await.unwrap();
    assert_eq!(
        statuses(&results),
        vec![("01", "AC"), ("02", "AC"), ("03", "AC")]
    );
    assert!(db::fetch_tasks(10, pool).await.unwrap().is_empty());

    // Workspaces never outlive the run
    assert_eq!(std::fs::read_dir(env.work_dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_judging_stops_at_first_failure() {
    require!("g++");
    let env = setup(2.0).await;
    let pool = &env.ctx.pool;
    let id = common::submit(pool, "cpp", &fixture("wa_large.cpp")).await;

    let verdict = run_one(&env.ctx, id, "w1").await.unwrap();
    assert_eq!(verdict, Verdict::WrongAnswer);

    let results = db::fetch_testcase_results(id, pool).await.unwrap();
    assert_eq!(statuses(&results), vec![("01", "AC"), ("02", "WA")]);
}

#[tokio::test]
async fn test_time_limit_on_every_case_stops_after_one() {
    require!("g++");
    let env = setup(0.5).await;
    let pool = &env.ctx.pool;
    let id = common::submit(pool, "cpp", &fixture("tle.cpp")).await;

    let verdict = run_one(&env.ctx, id, "w1").await.unwrap();
    assert_eq!(verdict, Verdict::TimeLimitExceeded);

    let results = db::fetch_testcase_results(id, pool).await.unwrap();
    assert_eq!(statuses(&results), vec![("01", "TLE")]);
}

#[tokio::test]
async fn test_compile_error_is_recorded() {
    require!("g++");
    let env = setup(2.0).await;
    let pool = &env.ctx.pool;
    let id = common::submit(pool, "cpp", &fixture("ce.cpp")).await;

    let verdict = run_one(&env.ctx, id, "w1").await.unwrap();
    assert_eq!(verdict, Verdict::CompileError);

    let submission = db::fetch_submission(id, pool).await.unwrap();
    assert_eq!(submission.status, "CE");
    assert!(db::fetch_testcase_results(id, pool).await.unwrap().is_empty());

    let compile_error: String =
        sqlx::query_scalar("SELECT compile_error FROM submissions WHERE id = ?")
            .bind(id)
            .fetch_one(pool)
            .await
            .unwrap();
    assert!(!compile_error.is_empty());
}

#[tokio::test]
async fn test_unsupported_language_is_compile_error() {
    let env = setup(2.0).await;
    let pool = &env.ctx.pool;
    let id = common::submit(pool, "brainfuck", "+[]").await;

    let verdict = run_one(&env.ctx, id, "w1").await.unwrap();
    assert_eq!(verdict, Verdict::CompileError);
    assert_eq!(db::fetch_submission(id, pool).await.unwrap().status, "CE");
}

#[tokio::test]
async fn test_broken_checker_is_fail() {
    require!("g++");
    let (pool, db_dir) = common::create_test_db().await;
    common::seed_problem_with(&pool, 2.0, &fixture("broken_checker.cpp")).await;
    let env = env_with(pool, db_dir);
    let pool = &env.ctx.pool;
    let id = common::submit(pool, "cpp", &fixture("ac.cpp")).await;

    assert!(run_one(&env.ctx, id, "w1").await.is_err());
    assert_eq!(db::fetch_submission(id, pool).await.unwrap().status, "Fail");
}

#[tokio::test]
async fn test_claimed_submission_is_left_alone() {
    let env = setup(2.0).await;
    let pool = &env.ctx.pool;
    let id = common::submit(pool, "cpp", &fixture("ac.cpp")).await;
    assert!(LeaseManager::new(pool.clone(), "w2").try_claim(id).await.unwrap());

    let err = run_one(&env.ctx, id, "w1").await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorkerError>(),
        Some(WorkerError::Claimed(claimed)) if *claimed == id
    ));

    let submission = db::fetch_submission(id, pool).await.unwrap();
    assert_eq!(submission.judge_name, "w2");
    assert_eq!(submission.status, "Queued");
}

#[tokio::test]
async fn test_rejudge_replaces_previous_results() {
    require!("g++");
    let env = setup(2.0).await;
    let pool = &env.ctx.pool;
    let id = common::submit(pool, "cpp", &fixture("wa.cpp")).await;

    assert_eq!(
        run_one(&env.ctx, id, "w1").await.unwrap(),
        Verdict::WrongAnswer
    );
    assert_eq!(db::fetch_testcase_results(id, pool).await.unwrap().len(), 1);

    sqlx::query("UPDATE submissions SET source = ? WHERE id = ?")
        .bind(fixture("ac.cpp"))
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
    assert_eq!(
        run_one(&env.ctx, id, "w2").await.unwrap(),
        Verdict::Accepted
    );

    let results = db::fetch_testcase_results(id, pool).await.unwrap();
    assert_eq!(
        statuses(&results),
        vec![("01", "AC"), ("02", "AC"), ("03", "AC")]
    );
    assert_eq!(db::fetch_submission(id, pool).await.unwrap().judge_name, "w2");
}

#[tokio::test]
async fn test_poll_once_skips_claimed_and_judges_next() {
    let env = setup(2.0).await;
    let pool = &env.ctx.pool;
    let busy = common::submit(pool, "brainfuck", "+").await;
    let free = common::submit(pool, "brainfuck", "-").await;
    db::push_task(busy, 10, pool).await.unwrap();
    db::push_task(free, 0, pool).await.unwrap();
    assert!(LeaseManager::new(pool.clone(), "w2").try_claim(busy).await.unwrap());

    assert!(poll_once(&env.ctx, "w1").await.unwrap());
    assert_eq!(db::fetch_submission(free, pool).await.unwrap().status, "CE");
    assert_eq!(db::fetch_tasks(10, pool).await.unwrap(), vec![busy]);

    // Only the claimed one is left
    assert!(!poll_once(&env.ctx, "w1").await.unwrap());
}

#[tokio::test]
async fn test_stolen_lease_aborts_judging() {
    require!("g++");
    let mut env = setup(10.0).await;
    env.ctx.heartbeat_interval = Duration::from_millis(100);
    let pool = env.ctx.pool.clone();
    let id = common::submit(&pool, "cpp", &fixture("tle.cpp")).await;

    // Take the submission over as soon as its first test case is running
    let thief = tokio::spawn({
        let pool = pool.clone();
        async move {
            loop {
                let submission = db::fetch_submission(id, &pool).await.unwrap();
                if submission.status == "Running" {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            sqlx::query("UPDATE submissions SET judge_name = 'w2', judge_ping = ? WHERE id = ?")
                .bind(oj_worker::create_timestamp())
                .bind(id)
                .execute(&pool)
                .await
                .unwrap();
        }
    });

    let err = tokio::time::timeout(Duration::from_secs(30), run_one(&env.ctx, id, "w1"))
        .await
        .expect("judging was not interrupted")
        .unwrap_err();
    thief.await.unwrap();

    assert!(matches!(
        err.downcast_ref::<WorkerError>(),
        Some(WorkerError::LeaseLost(lost)) if *lost == id
    ));
    assert!(db::fetch_testcase_results(id, &pool).await.unwrap().is_empty());
    let submission = db::fetch_submission(id, &pool).await.unwrap();
    assert_eq!(submission.judge_name, "w2");
    assert_eq!(submission.status, "Running");
    assert_eq!(std::fs::read_dir(env.work_dir.path()).unwrap().count(), 0);
}
