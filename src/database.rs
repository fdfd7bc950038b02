// ABOUTME: Backend dispatch - one open PostgreSQL or SQLite database plus its watermark store
// ABOUTME: Chooses the backend from the URL and runs jobs through the matching engine

use anyhow::Result;
use rusqlite::Connection;
use std::path::PathBuf;
use tokio_postgres::Client;

use crate::config::{JobConfig, VersionStoreKind};
use crate::materialize::{JsonFileVersionStore, SyncReport, VersionStore, Watermark};
use crate::postgres::PgVersionStore;
use crate::sqlite::SqliteVersionStore;
use crate::utils::{is_postgres_url, redact_url};

/// An open connection to the database holding the source views and targets.
pub enum Database {
    Postgres(Client),
    Sqlite(Connection),
}

impl Database {
    /// PostgreSQL for `postgres://` / `postgresql://` URLs, otherwise a SQLite
    /// file path (an optional `sqlite://` prefix is stripped).
    pub async fn open(url: &str) -> Result<Self> {
        if is_postgres_url(url) {
            tracing::info!("Connecting to PostgreSQL at {}", redact_url(url));
            let client = crate::postgres::connect_with_retry(url).await?;
            Ok(Database::Postgres(client))
        } else {
            let path = url.strip_prefix("sqlite://").unwrap_or(url);
            tracing::info!("Opening SQLite database {}", path);
            Ok(Database::Sqlite(crate::sqlite::open_sqlite(path)?))
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Database::Postgres(_) => "postgresql",
            Database::Sqlite(_) => "sqlite",
        }
    }

    /// Watermark store for this database.
    pub async fn state_store(
        &self,
        kind: VersionStoreKind,
        state_path: PathBuf,
    ) -> Result<StateStore<'_>> {
        Ok(match (kind, self) {
            (VersionStoreKind::File, _) => StateStore::File(JsonFileVersionStore::new(state_path)),
            (VersionStoreKind::Database, Database::Postgres(client)) => {
                StateStore::Postgres(PgVersionStore::open(client).await?)
            }
            (VersionStoreKind::Database, Database::Sqlite(conn)) => {
                StateStore::Sqlite(SqliteVersionStore::open(conn)?)
            }
        })
    }

    /// Run one synchronization pass of `job`.
    ///
    /// Engine errors are returned as `SyncError` inside the `anyhow::Error`.
    pub async fn run_job<V: VersionStore>(
        &self,
        job: &JobConfig,
        store: &V,
    ) -> Result<SyncReport> {
        let report = match self {
            Database::Postgres(client) => {
                crate::postgres::engine(client, job)?.execute(store).await?
            }
            Database::Sqlite(conn) => crate::sqlite::engine(conn, job)?.execute(store).await?,
        };
        Ok(report)
    }
}

/// The configured watermark store, dispatching to its backend.
pub enum StateStore<'a> {
    File(JsonFileVersionStore),
    Postgres(PgVersionStore<'a>),
    Sqlite(SqliteVersionStore<'a>),
}

impl StateStore<'_> {
    pub fn describe(&self) -> String {
        match self {
            StateStore::File(store) => format!("file {}", store.path().display()),
            StateStore::Postgres(_) => "postgresql table materializer_state".to_string(),
            StateStore::Sqlite(_) => "sqlite table materializer_state".to_string(),
        }
    }
}

impl VersionStore for StateStore<'_> {
    async fn get(&self, key: &str) -> Result<Option<Watermark>> {
        match self {
            StateStore::File(store) => store.get(key).await,
            StateStore::Postgres(store) => store.get(key).await,
            StateStore::Sqlite(store) => store.get(key).await,
        }
    }

    async fn set(&self, key: &str, watermark: Watermark) -> Result<()> {
        match self {
            StateStore::File(store) => store.set(key, watermark).await,
            StateStore::Postgres(store) => store.set(key, watermark).await,
            StateStore::Sqlite(store) => store.set(key, watermark).await,
        }
    }
}
