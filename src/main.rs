use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use oj_worker::config::{CliArgs, Command};
use oj_worker::database as db;
use oj_worker::worker::{WorkerContext, run_one, worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let n_threads = cli.threads;

    if n_threads == 0 {
        bail!("The number of worker threads must not be 0");
    }

    let config = cli.to_config().context("Failed to load configuration")?;
    config.validate()?;

    let db_path = cli.database.clone().unwrap_or_else(db::get_db_path);
    let db_pool = db::init_db(&db_path)
        .await
        .context("Failed to initialize database")?;

    let ctx = Arc::new(WorkerContext::from_config(&config, db_pool)?);
    let name = cli.worker_name();

    if let Some(Command::RunOne { id }) = cli.command {
        let verdict = run_one(&ctx, id, &name).await?;
        println!("{verdict}");
        return Ok(());
    }

    // ======= PREPARATION END, EXECUTION START =======

    let shutdown_token = CancellationToken::new();
    let mut workers = JoinSet::new();
    for i in 1..=n_threads {
        let identity = if n_threads == 1 {
            name.clone()
        } else {
            format!("{name}-{i}")
        };
        workers.spawn(worker(i, identity, ctx.clone(), shutdown_token.clone()));
    }

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        Some(res_worker) = workers.join_next() => {
            log::error!("A worker terminated unexpectedly: {:?}", res_worker);
        }
    }

    // 1. Broadcast shutdown signal to workers
    shutdown_token.cancel();
    log::info!("Shutdown signal sent to workers, waiting for them to finish...");

    // 2. Wait until every worker terminates
    while let Some(res) = workers.join_next().await {
        match res {
            Ok(Err(e)) => log::error!("Worker finished with error: {e:#}"),
            Err(e) if e.is_panic() => log::error!("Worker handle panicked: {:?}", e),
            Err(e) => log::error!("Worker handle finished with error: {:?}", e),
            Ok(Ok(())) => {}
        }
    }

    log::info!("Shutdown complete");
    Ok(())
}
