// ABOUTME: Write side of the SQLite backend - per-key merge into the target table
// ABOUTME: Cached prepared statements with numbered positional parameters

use anyhow::{Context, Result};
use rusqlite::{params_from_iter, Connection};

use crate::materialize::{ChangeKey, MergeOutcome, TableName, TargetMerger, ViewSlice};
use crate::sql::{
    build_delete_query, build_exists_query, build_insert_query, build_update_query, Dialect,
};
use crate::value::SqlValue;

pub struct SqliteMerger<'a> {
    conn: &'a Connection,
    table: TableName,
}

impl<'a> SqliteMerger<'a> {
    pub fn new(conn: &'a Connection, table: TableName) -> Self {
        Self { conn, table }
    }

    fn exists(&self, key: &ChangeKey) -> Result<bool> {
        let sql = build_exists_query(Dialect::Sqlite, &self.table, key.columns());
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let exists = stmt
            .query_row(params_from_iter(key.values()), |row| row.get::<_, bool>(0))
            .with_context(|| format!("Failed to look up {} in {}", key, self.table))?;
        Ok(exists)
    }
}

impl TargetMerger for SqliteMerger<'_> {
    async fn merge(&self, key: &ChangeKey, slice: &ViewSlice) -> Result<MergeOutcome> {
        if self.exists(key)? {
            let (set_columns, set_values): (Vec<String>, Vec<&SqlValue>) = slice
                .non_key(key.columns())
                .map(|(c, v)| (c.to_string(), v))
                .unzip();
            if set_columns.is_empty() {
                return Ok(MergeOutcome::Unchanged);
            }

            let sql =
                build_update_query(Dialect::Sqlite, &self.table, &set_columns, key.columns());
            self.conn
                .prepare_cached(&sql)?
                .execute(params_from_iter(set_values.into_iter().chain(key.values())))
                .with_context(|| format!("Failed to update {} in {}", key, self.table))?;
            Ok(MergeOutcome::Updated)
        } else {
            let sql = build_insert_query(Dialect::Sqlite, &self.table, slice.columns());
            self.conn
                .prepare_cached(&sql)?
                .execute(params_from_iter(slice.values()))
                .with_context(|| format!("Failed to insert {} into {}", key, self.table))?;
            Ok(MergeOutcome::Inserted)
        }
    }

    async fn remove(&self, key: &ChangeKey) -> Result<bool> {
        let sql = build_delete_query(Dialect::Sqlite, &self.table, key.columns());
        let deleted = self
            .conn
            .prepare_cached(&sql)?
            .execute(params_from_iter(key.values()))
            .with_context(|| format!("Failed to delete {} from {}", key, self.table))?;
        Ok(deleted > 0)
    }
}
