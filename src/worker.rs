use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::database::{self as db, SubmissionResult, seconds_to_millis};
use crate::judge::{Judge, JudgeOptions, Status, Summary, Verdict};
use crate::language::LanguageRegistry;
use crate::lease::LeaseManager;
use crate::sandbox::SimpleRunner;

/// Number of queued tasks looked at per poll
const POLL_BATCH: i64 = 16;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Another worker holds a live lease; try another submission
    #[error("submission {0} is claimed by another worker")]
    Claimed(i64),
    #[error("lease on submission {0} was lost while judging")]
    LeaseLost(i64),
}

/// Everything a worker needs besides its identity
pub struct WorkerContext {
    pub pool: SqlitePool,
    pub languages: LanguageRegistry,
    pub options: JudgeOptions,
    pub runner: SimpleRunner,
    pub work_dir: PathBuf,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl WorkerContext {
    pub fn from_config(config: &Config, pool: SqlitePool) -> Result<Self> {
        let languages = LanguageRegistry::with_overrides(&config.languages);
        let options = JudgeOptions {
            compile_time_limit: config.judge.compile_time_limit,
            checker_time_limit: config.judge.checker_time_limit,
            checker_language: languages.get(&config.judge.checker_language)?.clone(),
        };

        Ok(Self {
            pool,
            languages,
            options,
            runner: SimpleRunner::new(config.judge.output_limit),
            work_dir: config.judge.work_dir()?,
            poll_interval: config.worker.poll_interval(),
            heartbeat_interval: config.worker.heartbeat_interval(),
        })
    }
}

/// Claims, judges and records one submission
///
/// A contestant's non-AC verdict is a successful outcome. Errors are
/// infrastructure failures: [`WorkerError::Claimed`] when someone else holds
/// the lease, [`WorkerError::LeaseLost`] when the lease was taken away
/// mid-run, anything else for store, workspace or checker trouble.
pub async fn run_one(ctx: &WorkerContext, id: i64, worker: &str) -> Result<Verdict> {
    let lease = LeaseManager::new(ctx.pool.clone(), worker);
    if !lease
        .try_claim(id)
        .await
        .with_context(|| format!("Failed to claim submission {id}"))?
    {
        return Err(WorkerError::Claimed(id).into());
    }
    log::info!("Worker {worker} claimed submission {id}");

    let lost = CancellationToken::new();
    let heartbeat = lease.spawn_heartbeat(id, ctx.heartbeat_interval, lost.clone());

    // Dropping the judging future kills the running process and removes the workspace
    let outcome = tokio::select! {
        outcome = judge_submission(ctx, id, worker) => outcome,
        _ = lost.cancelled() => Err(WorkerError::LeaseLost(id).into()),
    };

    heartbeat.abort();
    outcome
}

async fn judge_submission(ctx: &WorkerContext, id: i64, worker: &str) -> Result<Verdict> {
    let submission = db::fetch_submission(id, &ctx.pool)
        .await
        .with_context(|| format!("Failed to fetch submission {id}"))?;
    let testdata = db::fetch_testdata(&submission.testhash, &ctx.pool)
        .await
        .with_context(|| format!("Failed to fetch testdata {}", submission.testhash))?;

    owned(db::clear_results(id, worker, &ctx.pool).await?, id)?;
    owned(
        db::update_status(id, worker, Status::Compiling, &ctx.pool).await?,
        id,
    )?;

    let mut record = SubmissionResult {
        verdict: Verdict::CompileError,
        testhash: submission.testhash.clone(),
        max_time: 0,
        max_memory: 0,
        compile_error: String::new(),
        cases: Vec::new(),
    };

    let Ok(language) = ctx.languages.get(&submission.lang) else {
        log::info!("Submission {id} uses unsupported language {}", submission.lang);
        record.compile_error = format!("unsupported language: {}", submission.lang);
        return finish(ctx, id, worker, record).await;
    };

    let mut judge = Judge::new(
        &ctx.work_dir,
        language,
        &testdata.checker,
        &submission.source,
        submission.time_limit,
    )?
    .with_options(ctx.options.clone())
    .with_runner(ctx.runner.clone());

    let checker = judge.compile_checker().await?;
    if !checker.success() {
        record.verdict = Verdict::Fail;
        finish(ctx, id, worker, record).await?;
        bail!(
            "Checker of problem {} failed to compile: {}",
            submission.problem_name,
            String::from_utf8_lossy(&checker.stderr)
        );
    }

    let compiled = judge.compile_source().await?;
    if !compiled.success() {
        record.compile_error = String::from_utf8_lossy(&compiled.stderr).into_owned();
        return finish(ctx, id, worker, record).await;
    }

    owned(
        db::update_status(id, worker, Status::Running, &ctx.pool).await?,
        id,
    )?;

    let mut summary = Summary::new();
    for case in &testdata.cases {
        let result = judge.test_case(&case.input, &case.expected).await?;
        let keep_going = summary.record(&case.name, &result);
        if let Some(last) = summary.cases().last() {
            owned(
                db::write_testcase_result(id, worker, last, &ctx.pool).await?,
                id,
            )?;
        }
        log::debug!("Submission {id} case {}: {}", case.name, result.status);
        if !keep_going {
            break;
        }
    }

    if let Err(e) = judge.close() {
        log::warn!("{e:#}");
    }

    record.verdict = summary.verdict();
    record.max_time = seconds_to_millis(summary.max_time());
    record.max_memory = summary.max_memory() as i64;
    record.cases = summary.cases().to_vec();
    finish(ctx, id, worker, record).await
}

async fn finish(
    ctx: &WorkerContext,
    id: i64,
    worker: &str,
    record: SubmissionResult,
) -> Result<Verdict> {
    owned(db::write_result(id, worker, &record, &ctx.pool).await?, id)?;
    log::info!(
        "Submission {id} judged by {worker}: {} ({} cases, {}ms, {} bytes)",
        record.verdict,
        record.cases.len(),
        record.max_time,
        record.max_memory
    );
    Ok(record.verdict)
}

fn owned(still_owner: bool, id: i64) -> Result<()> {
    if still_owner {
        Ok(())
    } else {
        Err(WorkerError::LeaseLost(id).into())
    }
}

/// Tries queued submissions in priority order until one is judged
///
/// Returns whether any submission was processed.
pub async fn poll_once(ctx: &WorkerContext, worker: &str) -> Result<bool> {
    let candidates = db::fetch_tasks(POLL_BATCH, &ctx.pool)
        .await
        .context("Failed to fetch tasks")?;

    for id in candidates {
        match run_one(ctx, id, worker).await {
            Ok(_) => return Ok(true),
            Err(e) => match e.downcast_ref::<WorkerError>() {
                Some(WorkerError::Claimed(_)) => {
                    log::debug!("Submission {id} is taken, trying the next one");
                }
                Some(WorkerError::LeaseLost(_)) => {
                    log::warn!("Worker {worker} gave up submission {id}: {e}");
                    return Ok(true);
                }
                None => {
                    log::error!("Worker {worker} failed on submission {id}: {e:#}");
                }
            },
        }
    }

    Ok(false)
}

pub async fn worker(
    id: u8,
    name: String,
    ctx: Arc<WorkerContext>,
    token: CancellationToken,
) -> Result<()> {
    log::info!("Worker {id} ({name}) initialized");

    loop {
        if token.is_cancelled() {
            log::info!("Worker {id} received shutdown signal, stopping");
            break;
        }

        // A submission in progress is finished before shutting down
        match poll_once(&ctx, &name).await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => log::error!("Worker {id} failed to poll: {e:#}"),
        }

        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(ctx.poll_interval) => {}
        }
    }

    log::info!("Worker {id} has shut down gracefully");
    Ok(())
}
