// ABOUTME: Watermarks stored in the materialized SQLite database itself
// ABOUTME: Table materializer_state(key, version, updated_at), upserted on commit

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::materialize::{VersionStore, Watermark};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS materializer_state (
    key         TEXT PRIMARY KEY,
    version     INTEGER NOT NULL,
    updated_at  TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#;

pub struct SqliteVersionStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteVersionStore<'a> {
    /// Create the state table if needed.
    pub fn open(conn: &'a Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize materializer_state table")?;
        Ok(Self { conn })
    }
}

impl VersionStore for SqliteVersionStore<'_> {
    async fn get(&self, key: &str) -> Result<Option<Watermark>> {
        let version: Option<i64> = self
            .conn
            .prepare_cached("SELECT version FROM materializer_state WHERE key = ?1")?
            .query_row([key], |row| row.get(0))
            .optional()
            .with_context(|| format!("Failed to read watermark '{}'", key))?;
        Ok(version.map(Watermark))
    }

    async fn set(&self, key: &str, watermark: Watermark) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO materializer_state(key, version, updated_at)
                 VALUES (?1, ?2, CURRENT_TIMESTAMP)
                 ON CONFLICT(key) DO UPDATE SET
                    version = excluded.version,
                    updated_at = CURRENT_TIMESTAMP",
                params![key, watermark.value()],
            )
            .with_context(|| format!("Failed to commit watermark '{}' = {}", key, watermark))?;
        Ok(())
    }
}
