// ABOUTME: reset command - rewinds a job's watermark to the beginning of history
// ABOUTME: The next sync re-reads every change the feed still reports

use anyhow::{bail, Result};

use super::open_state_store;
use crate::config::MaterializerConfig;
use crate::materialize::{VersionStore, Watermark};

pub async fn reset(config: &MaterializerConfig, job: Option<&str>) -> Result<()> {
    let jobs = config.select_jobs(job)?;
    let [job] = jobs.as_slice() else {
        bail!("Specify which job to reset with --job");
    };

    let mut database = None;
    let store = open_state_store(config, &mut database).await?;
    let key = job.version_key()?;
    let previous = store.get(&key).await?;
    store.set(&key, Watermark::BEGINNING).await?;

    tracing::warn!(
        "Reset watermark of job '{}' ({:?} -> {}); the next sync is a full resync",
        job.name,
        previous.map(|w| w.value()),
        Watermark::BEGINNING
    );
    println!("Watermark for job '{}' reset to {}", job.name, Watermark::BEGINNING);
    Ok(())
}
