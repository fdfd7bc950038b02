// ABOUTME: SQLite backend - change-log feed, slice fetcher, merger and watermark table
// ABOUTME: Builds a SyncEngine for one job over a single rusqlite connection

pub mod reader;
pub mod state;
pub mod writer;

pub use reader::{SqliteChangeFeed, SqliteKeyResolver, SqliteSliceFetcher};
pub use state::SqliteVersionStore;
pub use writer::SqliteMerger;

use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

use crate::config::JobConfig;
use crate::materialize::SyncEngine;

pub type SqliteEngine<'a> = SyncEngine<
    SqliteChangeFeed<'a>,
    SqliteKeyResolver<'a>,
    SqliteSliceFetcher<'a>,
    SqliteMerger<'a>,
>;

/// Open an existing SQLite database file.
///
/// A missing file is an error rather than a new empty database.
pub fn open_sqlite(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();
    if !path.exists() {
        bail!("SQLite database {} does not exist", path.display());
    }
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
    conn.busy_timeout(Duration::from_secs(5))
        .context("Failed to set SQLite busy timeout")?;
    tracing::debug!("Opened SQLite database {}", path.display());
    Ok(conn)
}

/// Engine for `job` with every collaborator on the same connection.
pub fn engine<'a>(conn: &'a Connection, job: &JobConfig) -> Result<SqliteEngine<'a>> {
    let target = job.target()?;
    let feed = SqliteChangeFeed::new(conn, job.changes()?, &job.version_column)
        .with_version_query(job.version_query.clone());
    Ok(SyncEngine::new(
        target.clone(),
        feed,
        SqliteKeyResolver::new(conn),
        SqliteSliceFetcher::new(conn, job.source()?),
        SqliteMerger::new(conn, target),
    )
    .with_options(job.engine_options()?)
    .with_observer(job.observer()))
}
