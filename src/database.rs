use std::fs;
use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Row};

use crate::judge::{CaseResult, Status, TestCase, Verdict};

const DATABASE_NAME: &str = "oj-worker.sqlite3";

pub fn get_db_path() -> PathBuf {
    use directories::ProjectDirs;

    let proj_dirs = ProjectDirs::from("", "", "oj-worker").expect("Unable to find user directory");
    let data_dir = proj_dirs.data_local_dir();

    fs::create_dir_all(data_dir).expect("Failed to create local data dir");

    data_dir.join(DATABASE_NAME)
}

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display()); // rwc = read/write/create
    let db_pool = SqlitePoolOptions::new()
        .max_connections(1) // Workers of one process share the connection, so their transactions never interleave
        .min_connections(0)
        .connect(&db_url)
        .await?;

    // PRAGMA statements cannot be run inside a transaction
    for pragma_sql in &[
        "PRAGMA foreign_keys = ON;",
        "PRAGMA busy_timeout = 5000;", // Other worker processes may hold the write lock
        "PRAGMA journal_mode = WAL;",
        "PRAGMA synchronous = NORMAL;",
    ] {
        sqlx::query(pragma_sql).execute(&db_pool).await?;
    }

    let mut tx = db_pool.begin().await?;

    for sql in &[
        r"
        CREATE TABLE IF NOT EXISTS users (
            name          TEXT    PRIMARY KEY
        );",
        r"
        CREATE TABLE IF NOT EXISTS problems (
            name          TEXT    PRIMARY KEY,
            title         TEXT    NOT NULL,
            statement     TEXT    NOT NULL DEFAULT '',
            timelimit     REAL    NOT NULL,
            testhash      TEXT    NOT NULL
        );",
        r"
        CREATE TABLE IF NOT EXISTS testdata (
            hash          TEXT    PRIMARY KEY,
            checker       TEXT    NOT NULL
        );",
        r"
        CREATE TABLE IF NOT EXISTS testcases (
            testhash      TEXT    NOT NULL,
            name          TEXT    NOT NULL,
            input         BLOB    NOT NULL,
            expected      BLOB    NOT NULL,
            PRIMARY KEY (testhash, name),
            FOREIGN KEY (testhash)  REFERENCES testdata (hash)
        );",
        r"
        CREATE TABLE IF NOT EXISTS submissions (
            id            INTEGER  PRIMARY KEY AUTOINCREMENT,
            created_time  TEXT     NOT NULL,
            updated_time  TEXT     NOT NULL,
            problem_name  TEXT     NOT NULL,
            lang          TEXT     NOT NULL,
            status        TEXT     NOT NULL,
            source        TEXT     NOT NULL,
            testhash      TEXT     NOT NULL DEFAULT '',
            max_time      INTEGER  NOT NULL DEFAULT 0,
            max_memory    INTEGER  NOT NULL DEFAULT 0,
            compile_error TEXT     NOT NULL DEFAULT '',
            judge_name    TEXT     NOT NULL DEFAULT '',
            judge_ping    TEXT,
            judge_tasked  BOOLEAN  NOT NULL DEFAULT 0,
            user_name     TEXT,
            FOREIGN KEY (problem_name)  REFERENCES problems (name),
            FOREIGN KEY (user_name)     REFERENCES users (name)
        );",
        r"
        CREATE TABLE IF NOT EXISTS submission_testcase_results (
            submission    INTEGER  NOT NULL,
            testcase      TEXT     NOT NULL,
            status        TEXT     NOT NULL,
            time          INTEGER  NOT NULL,
            memory        INTEGER  NOT NULL,
            PRIMARY KEY (submission, testcase),
            FOREIGN KEY (submission)  REFERENCES submissions (id)
        );",
        r"
        CREATE TABLE IF NOT EXISTS tasks (
            submission    INTEGER  PRIMARY KEY,
            priority      INTEGER  NOT NULL DEFAULT 0,
            FOREIGN KEY (submission)  REFERENCES submissions (id)
        );",
        "CREATE INDEX IF NOT EXISTS idx_tasks_priority ON tasks(priority);",
    ] {
        sqlx::query(sql).execute(tx.as_mut()).await?;
    }

    tx.commit().await?;

    log::info!("Initialized database at {}", db_path.as_ref().display());

    Ok(db_pool)
}

/// A submission joined with the problem fields the judge needs
#[derive(FromRow, Debug, Clone)]
pub struct Submission {
    pub id: i64,
    pub problem_name: String,
    pub problem_title: String,
    pub lang: String,
    pub status: String,
    pub source: String,
    /// Testdata set the problem currently points at
    pub testhash: String,
    /// Declared time limit in seconds
    pub time_limit: f64,
    pub max_time: i64,
    pub max_memory: i64,
    pub judge_name: String,
    pub judge_ping: Option<String>,
    pub judge_tasked: bool,
    pub user_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Problem {
    pub name: String,
    pub title: String,
    pub statement: String,
    pub time_limit: f64,
    pub testhash: String,
}

#[derive(Debug, Clone)]
pub struct TestData {
    pub checker: String,
    /// Ordered by case name
    pub cases: Vec<TestCase>,
}

/// Everything written back once a submission reaches a final verdict
#[derive(Debug, Clone)]
pub struct SubmissionResult {
    pub verdict: Verdict,
    /// Testdata set actually judged against
    pub testhash: String,
    /// Worst time over executed cases in milliseconds
    pub max_time: i64,
    /// Worst memory over executed cases in bytes
    pub max_memory: i64,
    pub compile_error: String,
    pub cases: Vec<CaseResult>,
}

/// Stored per-test-case result, time in milliseconds
#[derive(FromRow, Debug, Clone, PartialEq, Eq)]
pub struct StoredCaseResult {
    pub testcase: String,
    pub status: String,
    pub time: i64,
    pub memory: i64,
}

pub fn seconds_to_millis(seconds: f64) -> i64 {
    (seconds * 1000.0).round() as i64
}

pub async fn fetch_submission(id: i64, pool: &SqlitePool) -> sqlx::Result<Submission> {
    log::debug!("Trying to fetch submission {id} from database");

    sqlx::query_as::<_, Submission>(
        r#"
        SELECT s.id, s.problem_name, p.title AS problem_title, s.lang, s.status, s.source,
               p.testhash AS testhash, p.timelimit AS time_limit, s.max_time, s.max_memory,
               s.judge_name, s.judge_ping, s.judge_tasked, s.user_name
        FROM submissions s
        JOIN problems p ON p.name = s.problem_name
        WHERE s.id = ?
        "#,
    )
    .bind(id)
    .fetch_one(pool)
    .await
}

pub async fn fetch_testdata(hash: &str, pool: &SqlitePool) -> sqlx::Result<TestData> {
    let checker: String = sqlx::query("SELECT checker FROM testdata WHERE hash = ?")
        .bind(hash)
        .fetch_one(pool)
        .await?
        .try_get("checker")?;

    let rows = sqlx::query(
        r#"
        SELECT name, input, expected
        FROM testcases
        WHERE testhash = ?
        ORDER BY name
        "#,
    )
    .bind(hash)
    .fetch_all(pool)
    .await?;

    let mut cases = Vec::with_capacity(rows.len());
    for row in rows {
        cases.push(TestCase {
            name: row.try_get("name")?,
            input: row.try_get("input")?,
            expected: row.try_get("expected")?,
        });
    }

    Ok(TestData { checker, cases })
}

/// Returns up to `limit` queued submission ids, highest priority first
pub async fn fetch_tasks(limit: i64, pool: &SqlitePool) -> sqlx::Result<Vec<i64>> {
    let rows = sqlx::query(
        r#"
        SELECT submission FROM tasks
        ORDER BY priority DESC, submission
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(|row| row.try_get("submission")).collect()
}

/// Queues a submission for (re)judging
pub async fn push_task(submission: i64, priority: i64, pool: &SqlitePool) -> sqlx::Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("INSERT OR REPLACE INTO tasks (submission, priority) VALUES (?, ?)")
        .bind(submission)
        .bind(priority)
        .execute(tx.as_mut())
        .await?;

    sqlx::query("UPDATE submissions SET judge_tasked = 1 WHERE id = ?")
        .bind(submission)
        .execute(tx.as_mut())
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Moves a submission through its transient states
///
/// Returns `false` without writing when `worker` is no longer the owner.
pub async fn update_status(
    id: i64,
    worker: &str,
    status: Status,
    pool: &SqlitePool,
) -> sqlx::Result<bool> {
    let now = crate::create_timestamp();
    let updated = sqlx::query(
        r#"
        UPDATE submissions
        SET status = ?, updated_time = ?
        WHERE id = ? AND judge_name = ?
        "#,
    )
    .bind(status.as_str())
    .bind(now)
    .bind(id)
    .bind(worker)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(updated == 1)
}

/// Drops the per-case results of a previous judging
pub async fn clear_results(id: i64, worker: &str, pool: &SqlitePool) -> sqlx::Result<bool> {
    let mut tx = pool.begin().await?;

    if !is_owner(id, worker, &mut tx).await? {
        return Ok(false);
    }

    sqlx::query("DELETE FROM submission_testcase_results WHERE submission = ?")
        .bind(id)
        .execute(tx.as_mut())
        .await?;

    tx.commit().await?;
    Ok(true)
}

/// Streams one executed test case result
pub async fn write_testcase_result(
    id: i64,
    worker: &str,
    case: &CaseResult,
    pool: &SqlitePool,
) -> sqlx::Result<bool> {
    let mut tx = pool.begin().await?;

    if !is_owner(id, worker, &mut tx).await? {
        return Ok(false);
    }
    insert_case(id, case, &mut tx).await?;

    tx.commit().await?;
    Ok(true)
}

/// Writes the final verdict and all executed case results, and retires the
/// lease and the queued task
///
/// Returns `false` without writing when `worker` is no longer the owner.
pub async fn write_result(
    id: i64,
    worker: &str,
    result: &SubmissionResult,
    pool: &SqlitePool,
) -> sqlx::Result<bool> {
    let now = crate::create_timestamp();
    let mut tx = pool.begin().await?;

    // Clearing judge_ping ends the lease; judge_name is kept as a record
    let updated = sqlx::query(
        r#"
        UPDATE submissions
        SET status = ?, testhash = ?, max_time = ?, max_memory = ?, compile_error = ?,
            judge_ping = NULL, judge_tasked = 0, updated_time = ?
        WHERE id = ? AND judge_name = ?
        "#,
    )
    .bind(result.verdict.as_str())
    .bind(&result.testhash)
    .bind(result.max_time)
    .bind(result.max_memory)
    .bind(&result.compile_error)
    .bind(now)
    .bind(id)
    .bind(worker)
    .execute(tx.as_mut())
    .await?
    .rows_affected();

    if updated == 0 {
        return Ok(false);
    }

    sqlx::query("DELETE FROM submission_testcase_results WHERE submission = ?")
        .bind(id)
        .execute(tx.as_mut())
        .await?;

    for case in &result.cases {
        insert_case(id, case, &mut tx).await?;
    }

    sqlx::query("DELETE FROM tasks WHERE submission = ?")
        .bind(id)
        .execute(tx.as_mut())
        .await?;

    tx.commit().await?;
    Ok(true)
}

pub async fn fetch_testcase_results(
    id: i64,
    pool: &SqlitePool,
) -> sqlx::Result<Vec<StoredCaseResult>> {
    sqlx::query_as::<_, StoredCaseResult>(
        r#"
        SELECT testcase, status, time, memory
        FROM submission_testcase_results
        WHERE submission = ?
        ORDER BY testcase
        "#,
    )
    .bind(id)
    .fetch_all(pool)
    .await
}

pub async fn insert_problem(problem: &Problem, pool: &SqlitePool) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO problems (name, title, statement, timelimit, testhash)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&problem.name)
    .bind(&problem.title)
    .bind(&problem.statement)
    .bind(problem.time_limit)
    .bind(&problem.testhash)
    .execute(pool)
    .await?;
    Ok(())
}

/// Stores a testdata set, replacing any cases previously stored under `hash`
pub async fn insert_testdata(hash: &str, data: &TestData, pool: &SqlitePool) -> sqlx::Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("INSERT OR REPLACE INTO testdata (hash, checker) VALUES (?, ?)")
        .bind(hash)
        .bind(&data.checker)
        .execute(tx.as_mut())
        .await?;

    sqlx::query("DELETE FROM testcases WHERE testhash = ?")
        .bind(hash)
        .execute(tx.as_mut())
        .await?;

    for case in &data.cases {
        sqlx::query(
            r#"
            INSERT INTO testcases (testhash, name, input, expected)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(hash)
        .bind(&case.name)
        .bind(&case.input)
        .bind(&case.expected)
        .execute(tx.as_mut())
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Creates a queued submission and returns its id
pub async fn insert_submission(
    problem_name: &str,
    lang: &str,
    source: &str,
    user_name: Option<&str>,
    pool: &SqlitePool,
) -> sqlx::Result<i64> {
    let now = crate::create_timestamp();
    let mut tx = pool.begin().await?;

    if let Some(user) = user_name {
        sqlx::query("INSERT OR IGNORE INTO users (name) VALUES (?)")
            .bind(user)
            .execute(tx.as_mut())
            .await?;
    }

    let id = sqlx::query(
        r#"
        INSERT INTO submissions (created_time, updated_time, problem_name, lang, status, source, user_name)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&now)
    .bind(&now)
    .bind(problem_name)
    .bind(lang)
    .bind(Status::Queued.as_str())
    .bind(source)
    .bind(user_name)
    .execute(tx.as_mut())
    .await?
    .last_insert_rowid();

    tx.commit().await?;
    Ok(id)
}

async fn is_owner(
    id: i64,
    worker: &str,
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
) -> sqlx::Result<bool> {
    let row = sqlx::query("SELECT 1 FROM submissions WHERE id = ? AND judge_name = ?")
        .bind(id)
        .bind(worker)
        .fetch_optional(tx.as_mut())
        .await?;
    Ok(row.is_some())
}

async fn insert_case(
    id: i64,
    case: &CaseResult,
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO submission_testcase_results (submission, testcase, status, time, memory)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(id)
    .bind(&case.name)
    .bind(case.status.as_str())
    .bind(seconds_to_millis(case.time))
    .bind(case.memory as i64)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}
