// ABOUTME: Read side of the PostgreSQL backend - change feed, key resolver, slice fetcher
// ABOUTME: Changed keys come from a set-returning function taking the last watermark

use anyhow::{bail, Context, Result};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Row};

use super::statements::StatementCache;
use crate::materialize::{
    ChangeFeedSource, ChangeKey, ChangeSet, KeyColumnResolver, TableName, ViewSlice,
    ViewSliceFetcher, Watermark,
};
use crate::sql::{build_slice_query, Dialect};
use crate::value::{from_postgres, SqlValue};

pub const DEFAULT_SCHEMA: &str = "public";
/// Highest transaction id below every transaction still in progress.
///
/// Change logs stamped with `txid_current()` are committed out of id order, so
/// the ceiling must stay below any open writer; otherwise its rows appear
/// later with a version the committed watermark already passed.
pub const DEFAULT_VERSION_QUERY: &str =
    "SELECT txid_snapshot_xmin(txid_current_snapshot()) - 1";

/// Decode every column of `row` as (name, value) pairs.
fn row_pairs(row: &Row) -> Result<Vec<(String, SqlValue)>> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| Ok((column.name().to_string(), from_postgres(row, idx)?)))
        .collect()
}

/// Change feed backed by a function such as `dbo.fn_sales_changes(since bigint)`.
///
/// The function must return exactly the target's primary-key columns, one row
/// per change. The ceiling is read with `version_query`, which must never pass
/// a version an uncommitted writer can still produce.
pub struct PgChangeFeed<'a> {
    client: &'a Client,
    function: TableName,
    version_query: String,
    statements: StatementCache,
}

impl<'a> PgChangeFeed<'a> {
    pub fn new(client: &'a Client, function: TableName) -> Self {
        Self {
            client,
            function,
            version_query: DEFAULT_VERSION_QUERY.to_string(),
            statements: StatementCache::new(),
        }
    }

    pub fn with_version_query(mut self, query: Option<String>) -> Self {
        if let Some(query) = query {
            self.version_query = query;
        }
        self
    }
}

/// Invocation of the change function with the watermark as its only argument.
pub fn changes_query(function: &TableName) -> String {
    format!("SELECT * FROM {}($1::bigint)", function.quoted())
}

impl ChangeFeedSource for PgChangeFeed<'_> {
    async fn current_watermark(&self) -> Result<Watermark> {
        let row = self
            .client
            .query_one(self.version_query.as_str(), &[])
            .await
            .with_context(|| format!("Failed to run version query '{}'", self.version_query))?;
        match from_postgres(&row, 0)? {
            SqlValue::Null => Ok(Watermark::BEGINNING),
            value => match value.as_i64() {
                Some(v) => Ok(Watermark(v)),
                None => bail!(
                    "Version query '{}' returned a non-integer value {}",
                    self.version_query,
                    value
                ),
            },
        }
    }

    async fn changed_keys(&self, since: Watermark) -> Result<ChangeSet> {
        let sql = changes_query(&self.function);
        let statement = self.statements.prepare(self.client, &sql).await?;
        let columns: Vec<String> = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        let rows = self
            .client
            .query(&statement, &[&since.value()])
            .await
            .with_context(|| format!("Failed to read changes from {}", self.function))?;

        let keys = rows
            .iter()
            .map(|row| row_pairs(row).map(ChangeKey::new))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            "{} reported {} change(s) since {}",
            self.function,
            keys.len(),
            since
        );
        Ok(ChangeSet { columns, keys })
    }
}

/// Primary-key lookup through the system catalogs.
pub struct PgKeyResolver<'a> {
    client: &'a Client,
}

impl<'a> PgKeyResolver<'a> {
    pub fn new(client: &'a Client) -> Self {
        Self { client }
    }
}

impl KeyColumnResolver for PgKeyResolver<'_> {
    async fn resolve_primary_key(&self, table: &TableName) -> Result<Vec<String>> {
        let schema = table.schema_or(DEFAULT_SCHEMA);
        let rows = self
            .client
            .query(
                "SELECT a.attname::text
                 FROM pg_index i
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
                 JOIN pg_class c ON c.oid = i.indrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE i.indisprimary
                   AND n.nspname = $1
                   AND c.relname = $2
                 ORDER BY array_position(i.indkey, a.attnum)",
                &[&schema, &table.name],
            )
            .await
            .with_context(|| format!("Failed to get primary key for {}.{}", schema, table.name))?;

        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(Into::into))
            .collect()
    }
}

/// Re-reads one key's rows from the source view.
pub struct PgSliceFetcher<'a> {
    client: &'a Client,
    view: TableName,
    statements: StatementCache,
}

impl<'a> PgSliceFetcher<'a> {
    pub fn new(client: &'a Client, view: TableName) -> Self {
        Self {
            client,
            view,
            statements: StatementCache::new(),
        }
    }
}

impl ViewSliceFetcher for PgSliceFetcher<'_> {
    async fn fetch_slice(&self, key: &ChangeKey) -> Result<Vec<ViewSlice>> {
        let sql = self.query_shape(key.columns());
        let statement = self.statements.prepare(self.client, &sql).await?;
        let params: Vec<&(dyn ToSql + Sync)> = key
            .values()
            .iter()
            .map(|v| v as &(dyn ToSql + Sync))
            .collect();

        let rows = self
            .client
            .query(&statement, &params)
            .await
            .with_context(|| format!("Failed to read {} for key {}", self.view, key))?;

        rows.iter()
            .map(|row| row_pairs(row).map(ViewSlice::new))
            .collect()
    }

    fn query_shape(&self, key_columns: &[String]) -> String {
        build_slice_query(Dialect::Postgres, &self.view, key_columns)
    }
}
