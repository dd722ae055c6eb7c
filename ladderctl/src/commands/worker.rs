use std::sync::Arc;
use std::time::Duration;

use ladder_core::{sweep_orphans, JobStatus, Orchestrator};
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::{AppContext, OutputFormat, Result, WorkerRunArgs, WorkspaceSweepArgs};

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Claims queued jobs and drives each through its orchestrator, bounded
/// by `worker.max_parallel_jobs`. Orphan workspaces are swept hourly.
pub async fn run(context: &AppContext, args: &WorkerRunArgs) -> Result<()> {
    let config = context.config.clone();
    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        context.store.clone(),
        Arc::new(context.s3()),
        context.executor(),
    ));
    let slots = Arc::new(Semaphore::new(config.worker.max_parallel_jobs));

    info!(
        workdir = %config.worker.workdir_root,
        max_parallel_jobs = config.worker.max_parallel_jobs,
        "worker started"
    );

    let mut sweep_timer = tokio::time::interval(SWEEP_INTERVAL);
    let mut poll_timer = tokio::time::interval(Duration::from_secs(args.poll_secs.max(1)));

    loop {
        tokio::select! {
            _ = poll_timer.tick() => {
                let available = slots.available_permits();
                if available == 0 {
                    continue;
                }
                let queued = context.store.list_by_status(JobStatus::Queued, available)?;
                if queued.is_empty() && args.once && slots.available_permits() == config.worker.max_parallel_jobs {
                    info!("queue drained");
                    return Ok(());
                }
                for job in queued {
                    let permit = slots.clone().acquire_owned().await.expect("semaphore closed");
                    let orchestrator = orchestrator.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        match orchestrator.run_job(job.id).await {
                            Ok(status) => info!(job_id = %job.id, status = %status, "job done"),
                            Err(err) => error!(job_id = %job.id, error = %err, "job run failed"),
                        }
                    });
                }
            }
            _ = sweep_timer.tick() => {
                let root = config.worker.workdir_root.clone();
                let max_age = config.worker.orphan_max_age();
                match sweep_orphans(&root, max_age) {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "swept orphan workspaces"),
                    Err(err) => warn!(error = %err, "orphan sweep failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested, waiting for running jobs");
                let _ = slots.acquire_many(config.worker.max_parallel_jobs as u32).await;
                return Ok(());
            }
        }
    }
}

pub fn sweep(context: &AppContext, args: &WorkspaceSweepArgs) -> Result<()> {
    let max_age = args
        .max_age_hours
        .map(|hours| Duration::from_secs(hours * 3600))
        .unwrap_or_else(|| context.config.worker.orphan_max_age());
    let removed = sweep_orphans(&context.config.worker.workdir_root, max_age)?;
    match context.format {
        OutputFormat::Json => println!("{}", json!({ "removed": removed })),
        OutputFormat::Text => println!("removed {removed} orphan workspace(s)"),
    }
    Ok(())
}

pub async fn health(context: &AppContext) -> Result<()> {
    use ladder_core::ObjectStorage;

    let store_ok = context.store.count_by_status().is_ok();
    let s3 = context.s3();
    let s3_result = s3.health().await;
    let s3_ok = s3_result.is_ok();

    match context.format {
        OutputFormat::Json => println!(
            "{}",
            json!({
                "database": store_ok,
                "s3": s3_ok,
                "s3_error": s3_result.err().map(|e| e.to_string()),
            })
        ),
        OutputFormat::Text => {
            println!("database: {}", if store_ok { "ok" } else { "unreachable" });
            match s3_result {
                Ok(()) => println!("s3:       ok"),
                Err(err) => println!("s3:       {err}"),
            }
        }
    }
    Ok(())
}
