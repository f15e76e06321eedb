//! Service loop command.

use super::Context;
use anyhow::{Result, bail};
use cloak_scheduler::Worker;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

pub async fn run(ctx: &Context, poll_interval: Option<f64>, once: bool) -> Result<ExitCode> {
    let poll_interval = match poll_interval {
        Some(secs) if secs.is_finite() && secs > 0.0 => Duration::from_secs_f64(secs),
        Some(secs) => bail!("Poll interval must be a positive number of seconds, got {}", secs),
        None => ctx.config.poll_interval,
    };

    let worker_id = format!("worker-{}", std::process::id());
    let worker = Worker::new(worker_id, ctx.dispatcher(), poll_interval);

    if once {
        match worker.run_once().await? {
            Some(job) => println!("Processed job {}: {}", job.id, job.status),
            None => println!("No queued jobs."),
        }
        return Ok(ExitCode::SUCCESS);
    }

    println!("Obfuscation service started. Press Ctrl+C to stop.");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested, finishing current job");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for Ctrl+C");
                // Keep the sender alive so the worker keeps running
                shutdown_tx.closed().await;
            }
        }
    });

    worker.run(shutdown_rx).await;
    println!("Service stopping...");
    Ok(ExitCode::SUCCESS)
}
