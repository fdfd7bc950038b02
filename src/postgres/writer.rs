// ABOUTME: Write side of the PostgreSQL backend - per-key merge into the target table
// ABOUTME: UPDATE when the key exists, INSERT otherwise, DELETE for vanished keys

use anyhow::{Context, Result};
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

use super::statements::StatementCache;
use crate::materialize::{ChangeKey, MergeOutcome, TableName, TargetMerger, ViewSlice};
use crate::sql::{
    build_delete_query, build_exists_query, build_insert_query, build_update_query, Dialect,
};
use crate::value::SqlValue;

fn as_params<'v>(values: impl IntoIterator<Item = &'v SqlValue>) -> Vec<&'v (dyn ToSql + Sync)> {
    values
        .into_iter()
        .map(|v| v as &(dyn ToSql + Sync))
        .collect()
}

/// Applies view slices to a target table one key at a time.
///
/// Statements are prepared once per column shape and reused for every key.
pub struct PgMerger<'a> {
    client: &'a Client,
    table: TableName,
    statements: StatementCache,
}

impl<'a> PgMerger<'a> {
    pub fn new(client: &'a Client, table: TableName) -> Self {
        Self {
            client,
            table,
            statements: StatementCache::new(),
        }
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    async fn exists(&self, key: &ChangeKey) -> Result<bool> {
        let sql = build_exists_query(Dialect::Postgres, &self.table, key.columns());
        let statement = self.statements.prepare(self.client, &sql).await?;
        let row = self
            .client
            .query_one(&statement, &as_params(key.values()))
            .await
            .with_context(|| format!("Failed to look up {} in {}", key, self.table))?;
        Ok(row.try_get::<_, bool>(0)?)
    }
}

impl TargetMerger for PgMerger<'_> {
    async fn merge(&self, key: &ChangeKey, slice: &ViewSlice) -> Result<MergeOutcome> {
        if self.exists(key).await? {
            let (set_columns, set_values): (Vec<String>, Vec<&SqlValue>) = slice
                .non_key(key.columns())
                .map(|(c, v)| (c.to_string(), v))
                .unzip();
            if set_columns.is_empty() {
                return Ok(MergeOutcome::Unchanged);
            }

            let sql =
                build_update_query(Dialect::Postgres, &self.table, &set_columns, key.columns());
            let statement = self.statements.prepare(self.client, &sql).await?;
            let params = as_params(set_values.into_iter().chain(key.values()));
            self.client
                .execute(&statement, &params)
                .await
                .with_context(|| format!("Failed to update {} in {}", key, self.table))?;
            Ok(MergeOutcome::Updated)
        } else {
            let sql = build_insert_query(Dialect::Postgres, &self.table, slice.columns());
            let statement = self.statements.prepare(self.client, &sql).await?;
            self.client
                .execute(&statement, &as_params(slice.values()))
                .await
                .with_context(|| format!("Failed to insert {} into {}", key, self.table))?;
            Ok(MergeOutcome::Inserted)
        }
    }

    async fn remove(&self, key: &ChangeKey) -> Result<bool> {
        let sql = build_delete_query(Dialect::Postgres, &self.table, key.columns());
        let statement = self.statements.prepare(self.client, &sql).await?;
        let deleted = self
            .client
            .execute(&statement, &as_params(key.values()))
            .await
            .with_context(|| format!("Failed to delete {} from {}", key, self.table))?;
        Ok(deleted > 0)
    }
}

