// ABOUTME: Watermarks stored in the materialized PostgreSQL database itself
// ABOUTME: Table materializer_state(key, version, updated_at), upserted on commit

use anyhow::{Context, Result};
use tokio_postgres::Client;

use crate::materialize::{VersionStore, Watermark};

pub const STATE_TABLE: &str = "materializer_state";

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS materializer_state (
    key         text PRIMARY KEY,
    version     bigint NOT NULL,
    updated_at  timestamptz NOT NULL DEFAULT now()
)";

pub struct PgVersionStore<'a> {
    client: &'a Client,
}

impl<'a> PgVersionStore<'a> {
    /// Create the state table if needed.
    pub async fn open(client: &'a Client) -> Result<Self> {
        client
            .batch_execute(SCHEMA)
            .await
            .with_context(|| format!("Failed to create {} table", STATE_TABLE))?;
        Ok(Self { client })
    }
}

impl VersionStore for PgVersionStore<'_> {
    async fn get(&self, key: &str) -> Result<Option<Watermark>> {
        let row = self
            .client
            .query_opt("SELECT version FROM materializer_state WHERE key = $1", &[&key])
            .await
            .with_context(|| format!("Failed to read watermark '{}'", key))?;
        match row {
            Some(row) => Ok(Some(Watermark(row.try_get::<_, i64>(0)?))),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, watermark: Watermark) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO materializer_state (key, version, updated_at)
                 VALUES ($1, $2, now())
                 ON CONFLICT (key) DO UPDATE SET
                    version = EXCLUDED.version,
                    updated_at = now()",
                &[&key, &watermark.value()],
            )
            .await
            .with_context(|| format!("Failed to commit watermark '{}' = {}", key, watermark))?;
        Ok(())
    }
}
