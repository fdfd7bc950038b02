// ABOUTME: status command - prints the stored watermark of each job
// ABOUTME: Reads the watermark store only; never touches source or target tables

use anyhow::Result;

use super::open_state_store;
use crate::config::MaterializerConfig;
use crate::materialize::VersionStore;

pub async fn status(config: &MaterializerConfig, job: Option<&str>) -> Result<()> {
    let jobs = config.select_jobs(job)?;
    let mut database = None;
    let store = open_state_store(config, &mut database).await?;

    println!("Watermarks ({}):", store.describe());
    for job in jobs {
        let key = job.version_key()?;
        match store.get(&key).await? {
            Some(watermark) => println!("  {}: {} (key {})", job.name, watermark, key),
            None => println!("  {}: never synced (key {})", job.name, key),
        }
    }
    Ok(())
}
