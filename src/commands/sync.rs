// ABOUTME: sync command - runs every selected job once or on a fixed interval
// ABOUTME: A failing job is logged and reported; the remaining jobs still run

use anyhow::{bail, Context, Result};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::interval;

use crate::config::{JobConfig, MaterializerConfig};
use crate::database::Database;
use crate::materialize::SyncError;

pub struct SyncOptions {
    pub config: MaterializerConfig,
    /// Only run this job.
    pub job: Option<String>,
    /// Run continuously with this period until Ctrl+C.
    pub interval: Option<Duration>,
}

/// Statistics from one pass over all selected jobs.
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub jobs_synced: usize,
    pub keys_processed: usize,
    pub rows_written: u64,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl CycleStats {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

pub async fn sync(opts: SyncOptions) -> Result<()> {
    let jobs = opts.config.select_jobs(opts.job.as_deref())?;

    match opts.interval {
        None => {
            let stats = run_cycle(&opts.config, &jobs).await?;
            report(&stats);
            if !stats.is_success() {
                bail!(
                    "{} of {} job(s) failed:\n  {}",
                    stats.errors.len(),
                    jobs.len(),
                    stats.errors.join("\n  ")
                );
            }
            Ok(())
        }
        Some(period) => {
            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        let _ = shutdown_tx.send(());
                    }
                    Err(e) => tracing::warn!(
                        "Failed to listen for Ctrl+C: {}; stop the process to exit",
                        e
                    ),
                }
            });
            run_continuous(&opts.config, &jobs, period, shutdown_rx).await
        }
    }
}

/// Open the database and run each job once.
pub async fn run_cycle(config: &MaterializerConfig, jobs: &[&JobConfig]) -> Result<CycleStats> {
    let start = Instant::now();
    let mut stats = CycleStats::default();

    let database = Database::open(config.database_url()?)
        .await
        .context("Failed to open database")?;
    let store = database
        .state_store(config.version_store, config.state_path())
        .await?;
    tracing::debug!("Watermarks stored in {}", store.describe());

    for job in jobs {
        match database.run_job(job, &store).await {
            Ok(result) => {
                stats.jobs_synced += 1;
                stats.keys_processed += result.keys_processed();
                stats.rows_written += result.rows_written();
            }
            Err(e) => {
                let retryable = e
                    .downcast_ref::<SyncError>()
                    .map(SyncError::is_retryable)
                    .unwrap_or(false);
                tracing::error!("Job '{}' failed: {:#}", job.name, e);
                if !retryable {
                    tracing::error!(
                        "Job '{}' needs attention before it can succeed; retrying will not help",
                        job.name
                    );
                }
                stats.errors.push(format!("{}: {:#}", job.name, e));
            }
        }
    }

    stats.duration_ms = start.elapsed().as_millis() as u64;
    Ok(stats)
}

fn report(stats: &CycleStats) {
    tracing::info!(
        "Sync completed: {} job(s), {} key(s), {} row(s) written in {}ms",
        stats.jobs_synced,
        stats.keys_processed,
        stats.rows_written,
        stats.duration_ms
    );
}

/// Run cycles on `period` until a shutdown signal arrives.
///
/// A cycle in flight when the signal arrives is dropped; its watermark is
/// not committed, so the next start replays it. A closed channel is not a
/// shutdown signal.
pub async fn run_continuous(
    config: &MaterializerConfig,
    jobs: &[&JobConfig],
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut ticker = interval(period);
    let mut cycles = 0u64;

    tracing::info!(
        "Materializing {} job(s) every {:?}; press Ctrl+C to stop",
        jobs.len(),
        period
    );

    loop {
        tokio::select! {
            biased;

            Ok(()) = shutdown.recv() => {
                tracing::info!("Shutdown signal received, stopping");
                break;
            }
            _ = ticker.tick() => {
                cycles += 1;
                tracing::debug!("Starting sync cycle {}", cycles);

                tokio::select! {
                    biased;
                    Ok(()) = shutdown.recv() => {
                        tracing::info!("Shutdown signal received during sync cycle, aborting");
                        break;
                    }
                    result = run_cycle(config, jobs) => {
                        match result {
                            Ok(stats) => {
                                report(&stats);
                                if !stats.is_success() {
                                    tracing::warn!(
                                        "Sync cycle {} had {} failed job(s)",
                                        cycles,
                                        stats.errors.len()
                                    );
                                }
                            }
                            Err(e) => {
                                tracing::error!("Sync cycle {} failed: {:#}", cycles, e);
                            }
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
