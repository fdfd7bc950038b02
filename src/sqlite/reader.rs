// ABOUTME: Read side of the SQLite backend - change-log feed, key resolver, slice fetcher
// ABOUTME: The change log is a table or view of key columns plus a version column

use anyhow::{bail, Context, Result};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection, Row};

use crate::materialize::{
    ChangeFeedSource, ChangeKey, ChangeSet, KeyColumnResolver, TableName, ViewSlice,
    ViewSliceFetcher, Watermark,
};
use crate::sql::{build_slice_query, Dialect};
use crate::utils::quote_ident;
use crate::value::{from_sqlite, SqlValue};

pub const DEFAULT_SCHEMA: &str = "main";

fn row_pairs(row: &Row<'_>, columns: &[String]) -> Result<Vec<(String, SqlValue)>> {
    columns
        .iter()
        .enumerate()
        .map(|(idx, column)| Ok((column.clone(), from_sqlite(row.get_ref(idx)?)?)))
        .collect()
}

/// `SELECT DISTINCT <keys> FROM <log> WHERE <version> > ?1`
pub fn changes_query(log: &TableName, key_columns: &[String], version_column: &str) -> String {
    format!(
        "SELECT DISTINCT {} FROM {} WHERE {} > ?1",
        key_columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", "),
        log.quoted(),
        quote_ident(version_column)
    )
}

/// Change feed over a change-log table maintained by triggers.
///
/// Every column of the log other than the version column is a key column.
/// The ceiling is the log's highest version unless `version_query` overrides it.
pub struct SqliteChangeFeed<'a> {
    conn: &'a Connection,
    log: TableName,
    version_column: String,
    version_query: Option<String>,
}

impl<'a> SqliteChangeFeed<'a> {
    pub fn new(conn: &'a Connection, log: TableName, version_column: &str) -> Self {
        Self {
            conn,
            log,
            version_column: version_column.to_string(),
            version_query: None,
        }
    }

    pub fn with_version_query(mut self, query: Option<String>) -> Self {
        self.version_query = query;
        self
    }

    fn ceiling_query(&self) -> String {
        match &self.version_query {
            Some(query) => query.clone(),
            None => format!(
                "SELECT COALESCE(MAX({}), 0) FROM {}",
                quote_ident(&self.version_column),
                self.log.quoted()
            ),
        }
    }

    /// Log columns other than the version column, in declaration order.
    fn key_columns(&self) -> Result<Vec<String>> {
        let stmt = self
            .conn
            .prepare_cached(&format!("SELECT * FROM {} LIMIT 0", self.log.quoted()))
            .with_context(|| format!("Failed to inspect change log {}", self.log))?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        if !names
            .iter()
            .any(|c| c.eq_ignore_ascii_case(&self.version_column))
        {
            bail!(
                "Change log {} has no version column '{}'",
                self.log,
                self.version_column
            );
        }
        Ok(names
            .into_iter()
            .filter(|c| !c.eq_ignore_ascii_case(&self.version_column))
            .collect())
    }
}

impl ChangeFeedSource for SqliteChangeFeed<'_> {
    async fn current_watermark(&self) -> Result<Watermark> {
        let sql = self.ceiling_query();
        let value: Value = self
            .conn
            .query_row(&sql, [], |row| row.get(0))
            .with_context(|| format!("Failed to run version query '{}'", sql))?;
        match from_sqlite(ValueRef::from(&value))? {
            SqlValue::Null => Ok(Watermark::BEGINNING),
            value => match value.as_i64() {
                Some(v) => Ok(Watermark(v)),
                None => bail!("Version query '{}' returned a non-integer value {}", sql, value),
            },
        }
    }

    async fn changed_keys(&self, since: Watermark) -> Result<ChangeSet> {
        let columns = self.key_columns()?;
        if columns.is_empty() {
            return Ok(ChangeSet::default());
        }

        let sql = changes_query(&self.log, &columns, &self.version_column);
        let mut stmt = self
            .conn
            .prepare_cached(&sql)
            .with_context(|| format!("Failed to prepare change query for {}", self.log))?;
        let mut rows = stmt
            .query([since.value()])
            .with_context(|| format!("Failed to read changes from {}", self.log))?;

        let mut keys = Vec::new();
        while let Some(row) = rows.next()? {
            keys.push(ChangeKey::new(row_pairs(row, &columns)?));
        }

        tracing::debug!("{} reported {} change(s) since {}", self.log, keys.len(), since);
        Ok(ChangeSet { columns, keys })
    }
}

/// Primary-key lookup through `pragma_table_info`.
pub struct SqliteKeyResolver<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteKeyResolver<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl KeyColumnResolver for SqliteKeyResolver<'_> {
    async fn resolve_primary_key(&self, table: &TableName) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT name FROM pragma_table_info(?1, ?2) WHERE pk > 0 ORDER BY pk",
        )?;
        let columns = stmt
            .query_map([table.name.as_str(), table.schema_or(DEFAULT_SCHEMA)], |row| {
                row.get::<_, String>(0)
            })
            .with_context(|| format!("Failed to get primary key for {}", table))?
            .collect::<Result<Vec<String>, _>>()
            .with_context(|| format!("Failed to read primary key for {}", table))?;
        Ok(columns)
    }
}

/// Re-reads one key's rows from the source view.
pub struct SqliteSliceFetcher<'a> {
    conn: &'a Connection,
    view: TableName,
}

impl<'a> SqliteSliceFetcher<'a> {
    pub fn new(conn: &'a Connection, view: TableName) -> Self {
        Self { conn, view }
    }
}

impl ViewSliceFetcher for SqliteSliceFetcher<'_> {
    async fn fetch_slice(&self, key: &ChangeKey) -> Result<Vec<ViewSlice>> {
        let sql = self.query_shape(key.columns());
        let mut stmt = self
            .conn
            .prepare_cached(&sql)
            .with_context(|| format!("Failed to prepare slice query for {}", self.view))?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let mut rows = stmt
            .query(params_from_iter(key.values()))
            .with_context(|| format!("Failed to read {} for key {}", self.view, key))?;
        let mut slices = Vec::new();
        while let Some(row) = rows.next()? {
            slices.push(ViewSlice::new(row_pairs(row, &columns)?));
        }
        Ok(slices)
    }

    fn query_shape(&self, key_columns: &[String]) -> String {
        build_slice_query(Dialect::Sqlite, &self.view, key_columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE sales_log (region_id INTEGER, item_id INTEGER, _version INTEGER);
             INSERT INTO sales_log VALUES (1, 7, 3), (1, 7, 4), (2, 8, 5);
             CREATE TABLE sales (region_id INTEGER, item_id INTEGER, qty INTEGER,
                                 PRIMARY KEY (item_id, region_id));
             INSERT INTO sales VALUES (1, 7, 42);",
        )
        .unwrap();
        conn
    }

    fn log() -> TableName {
        TableName::parse("sales_log").unwrap()
    }

    #[tokio::test]
    async fn test_change_feed_ceiling_and_keys() {
        let conn = setup();
        let feed = SqliteChangeFeed::new(&conn, log(), "_version");
        assert_eq!(feed.current_watermark().await.unwrap(), Watermark(5));

        let changes = feed.changed_keys(Watermark(3)).await.unwrap();
        assert_eq!(changes.columns, vec!["region_id", "item_id"]);
        assert_eq!(changes.keys.len(), 2);

        let none = feed.changed_keys(Watermark(5)).await.unwrap();
        assert!(none.keys.is_empty());
        assert_eq!(none.columns.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_log_ceiling_is_beginning() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE log (id INTEGER, _version INTEGER)")
            .unwrap();
        let feed = SqliteChangeFeed::new(&conn, TableName::parse("log").unwrap(), "_version");
        assert_eq!(feed.current_watermark().await.unwrap(), Watermark::BEGINNING);
    }

    #[tokio::test]
    async fn test_version_query_override() {
        let conn = setup();
        let feed = SqliteChangeFeed::new(&conn, log(), "_version")
            .with_version_query(Some("SELECT '17'".into()));
        assert_eq!(feed.current_watermark().await.unwrap(), Watermark(17));

        let bad = SqliteChangeFeed::new(&conn, log(), "_version")
            .with_version_query(Some("SELECT 'abc'".into()));
        assert!(bad.current_watermark().await.is_err());
    }

    #[tokio::test]
    async fn test_missing_version_column() {
        let conn = setup();
        let feed = SqliteChangeFeed::new(&conn, log(), "seq");
        let err = feed.changed_keys(Watermark(0)).await.unwrap_err();
        assert!(err.to_string().contains("no version column 'seq'"));
    }

    #[tokio::test]
    async fn test_primary_key_in_declared_order() {
        let conn = setup();
        let resolver = SqliteKeyResolver::new(&conn);
        let pk = resolver
            .resolve_primary_key(&TableName::parse("sales").unwrap())
            .await
            .unwrap();
        assert_eq!(pk, vec!["item_id", "region_id"]);

        let none = resolver
            .resolve_primary_key(&TableName::parse("sales_log").unwrap())
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_slice() {
        let conn = setup();
        let fetcher = SqliteSliceFetcher::new(&conn, TableName::parse("sales").unwrap());
        let key = ChangeKey::new(vec![
            ("item_id".into(), SqlValue::BigInt(7)),
            ("region_id".into(), SqlValue::BigInt(1)),
        ]);
        let slices = fetcher.fetch_slice(&key).await.unwrap();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].get("qty"), Some(&SqlValue::BigInt(42)));

        let missing = ChangeKey::new(vec![
            ("item_id".into(), SqlValue::BigInt(8)),
            ("region_id".into(), SqlValue::BigInt(2)),
        ]);
        assert!(fetcher.fetch_slice(&missing).await.unwrap().is_empty());
    }

    #[test]
    fn test_changes_query() {
        assert_eq!(
            changes_query(&log(), &["a".to_string(), "b".to_string()], "_version"),
            "SELECT DISTINCT \"a\", \"b\" FROM \"sales_log\" WHERE \"_version\" > ?1"
        );
    }
}
