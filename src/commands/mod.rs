// ABOUTME: Command implementations for the view-materializer CLI
// ABOUTME: Exports sync, status and reset plus shared config resolution

pub mod reset;
pub mod status;
pub mod sync;

pub use reset::reset;
pub use status::status;
pub use sync::{sync, SyncOptions};

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

use crate::config::{JobConfig, MaterializerConfig, VersionStoreKind, DEFAULT_CONFIG_FILE};
use crate::database::{Database, StateStore};
use crate::materialize::JsonFileVersionStore;

/// Job described entirely by command-line flags.
#[derive(Debug, Clone, Default)]
pub struct AdHocJob {
    pub source_view: Option<String>,
    pub target_table: Option<String>,
    pub changes_function: Option<String>,
    pub version_query: Option<String>,
    pub version_column: Option<String>,
    pub concurrency: Option<usize>,
}

impl AdHocJob {
    fn is_empty(&self) -> bool {
        self.source_view.is_none() && self.target_table.is_none() && self.changes_function.is_none()
    }

    fn into_job(self) -> Result<JobConfig> {
        let (Some(source), Some(target), Some(changes)) =
            (self.source_view, self.target_table, self.changes_function)
        else {
            bail!("--source-view, --target-table and --changes-function must be given together");
        };
        let mut job = JobConfig::new(target.clone(), source, target, changes);
        job.version_query = self.version_query;
        if let Some(column) = self.version_column {
            job.version_column = column;
        }
        if let Some(concurrency) = self.concurrency {
            job.concurrency = concurrency;
        }
        Ok(job)
    }
}

/// Command-line overrides applied on top of the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub database_url: Option<String>,
    pub state_file: Option<PathBuf>,
    pub job: AdHocJob,
}

/// Load the config file (explicit path, or `view-materializer.toml` if present)
/// and apply command-line overrides. Flag-defined jobs replace file jobs.
pub fn resolve_config(overrides: ConfigOverrides) -> Result<MaterializerConfig> {
    let mut config = match &overrides.config_path {
        Some(path) => MaterializerConfig::load(path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            MaterializerConfig::load(Path::new(DEFAULT_CONFIG_FILE))?
        }
        None => MaterializerConfig::default(),
    };

    if let Some(url) = overrides.database_url {
        config.database_url = Some(url);
    }
    if let Some(path) = overrides.state_file {
        config.version_store = VersionStoreKind::File;
        config.state_path = Some(path);
    }
    if !overrides.job.is_empty() {
        config.jobs = vec![overrides.job.into_job()?];
    }

    config.validate()?;
    Ok(config)
}

/// Open the watermark store. A file store needs no database connection.
async fn open_state_store<'a>(
    config: &MaterializerConfig,
    database: &'a mut Option<Database>,
) -> Result<StateStore<'a>> {
    match config.version_store {
        VersionStoreKind::File => Ok(StateStore::File(JsonFileVersionStore::new(
            config.state_path(),
        ))),
        VersionStoreKind::Database => {
            let db = Database::open(config.database_url()?).await?;
            let db: &'a Database = database.insert(db);
            db.state_store(VersionStoreKind::Database, config.state_path())
                .await
        }
    }
}
