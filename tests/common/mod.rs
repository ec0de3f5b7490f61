#![allow(dead_code)]

use std::path::{Path, PathBuf};

use sqlx::SqlitePool;
use tempfile::TempDir;

use oj_worker::database::{self as db, Problem, TestData};
use oj_worker::judge::TestCase;

pub const PROBLEM: &str = "aplusb";
pub const TESTHASH: &str = "aplusb-v1";

pub fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/data/aplusb")
        .join(name)
}

pub fn fixture(name: &str) -> String {
    std::fs::read_to_string(fixture_path(name))
        .unwrap_or_else(|e| panic!("Failed to read fixture {name}: {e}"))
}

/// Whether `tool` can be launched at all on this machine
pub fn have(tool: &str) -> bool {
    std::process::Command::new(tool)
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok()
}

macro_rules! require {
    ($tool:expr) => {
        if !common::have($tool) {
            eprintln!("{} is not available, skipping", $tool);
            return;
        }
    };
}
pub(crate) use require;

pub fn case(name: &str, input: &str, expected: &str) -> TestCase {
    TestCase {
        name: name.to_string(),
        input: input.as_bytes().to_vec(),
        expected: expected.as_bytes().to_vec(),
    }
}

/// A fresh database in its own directory, removed with the guard
pub async fn create_test_db() -> (SqlitePool, TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create test directory");
    let pool = db::init_db(dir.path().join("oj-worker.sqlite3"))
        .await
        .expect("Failed to initialize test database");
    (pool, dir)
}

/// Stores the a+b problem with three cases; the checker is not compiled here
pub async fn seed_problem(pool: &SqlitePool, time_limit: f64) {
    seed_problem_with(pool, time_limit, &fixture("checker.cpp")).await;
}

pub async fn seed_problem_with(pool: &SqlitePool, time_limit: f64, checker: &str) {
    let data = TestData {
        checker: checker.to_string(),
        cases: vec![
            case("01", "1 1\n", "2\n"),
            case("02", "2 3\n", "5\n"),
            case("03", "10 20\n", "30\n"),
        ],
    };
    db::insert_testdata(TESTHASH, &data, pool).await.unwrap();
    db::insert_problem(
        &Problem {
            name: PROBLEM.to_string(),
            title: "A + B".to_string(),
            statement: "Print the sum of two integers.".to_string(),
            time_limit,
            testhash: TESTHASH.to_string(),
        },
        pool,
    )
    .await
    .unwrap();
}

pub async fn submit(pool: &SqlitePool, lang: &str, source: &str) -> i64 {
    db::insert_submission(PROBLEM, lang, source, Some("alice"), pool)
        .await
        .unwrap()
}
