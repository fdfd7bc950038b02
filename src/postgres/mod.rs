// ABOUTME: PostgreSQL backend - connection handling plus the engine's collaborators
// ABOUTME: Builds a SyncEngine for one job over a single client connection

pub mod connection;
pub mod reader;
pub mod state;
pub mod statements;
pub mod writer;

pub use connection::{connect, connect_with_retry, init_tls_policy};
pub use reader::{PgChangeFeed, PgKeyResolver, PgSliceFetcher};
pub use state::PgVersionStore;
pub use writer::PgMerger;

use anyhow::Result;
use tokio_postgres::Client;

use crate::config::JobConfig;
use crate::materialize::SyncEngine;

pub type PgEngine<'a> =
    SyncEngine<PgChangeFeed<'a>, PgKeyResolver<'a>, PgSliceFetcher<'a>, PgMerger<'a>>;

/// Engine for `job` with every collaborator on the same connection.
pub fn engine<'a>(client: &'a Client, job: &JobConfig) -> Result<PgEngine<'a>> {
    let target = job.target()?;
    let feed =
        PgChangeFeed::new(client, job.changes()?).with_version_query(job.version_query.clone());
    Ok(SyncEngine::new(
        target.clone(),
        feed,
        PgKeyResolver::new(client),
        PgSliceFetcher::new(client, job.source()?),
        PgMerger::new(client, target),
    )
    .with_options(job.engine_options()?)
    .with_observer(job.observer()))
}
