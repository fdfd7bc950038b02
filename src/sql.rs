// ABOUTME: Parameterized SQL text builders shared by the PostgreSQL and SQLite backends
// ABOUTME: Only identifiers are spliced in (quoted); every value is a placeholder

use crate::materialize::TableName;
use crate::utils::quote_ident;

/// Placeholder syntax of the target database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `$1, $2, ...`
    Postgres,
    /// `?1, ?2, ...`
    Sqlite,
}

impl Dialect {
    pub fn placeholder(self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", n),
            Dialect::Sqlite => format!("?{}", n),
        }
    }
}

/// `"k1" = $first AND "k2" = $first+1 ...`
fn key_predicate(dialect: Dialect, key_columns: &[String], first: usize) -> String {
    key_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = {}", quote_ident(c), dialect.placeholder(first + i)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Per-key lookup of the source view.
pub fn build_slice_query(dialect: Dialect, view: &TableName, key_columns: &[String]) -> String {
    format!(
        "SELECT * FROM {} WHERE {}",
        view.quoted(),
        key_predicate(dialect, key_columns, 1)
    )
}

pub fn build_exists_query(dialect: Dialect, table: &TableName, key_columns: &[String]) -> String {
    format!(
        "SELECT EXISTS(SELECT 1 FROM {} WHERE {})",
        table.quoted(),
        key_predicate(dialect, key_columns, 1)
    )
}

/// Generates:
/// ```sql
/// INSERT INTO "schema"."table" ("c1", "c2") VALUES ($1, $2)
/// ```
pub fn build_insert_query(dialect: Dialect, table: &TableName, columns: &[String]) -> String {
    let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|n| dialect.placeholder(n)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table.quoted(),
        quoted.join(", "),
        placeholders.join(", ")
    )
}

/// Generates:
/// ```sql
/// UPDATE "schema"."table" SET "c1" = $1, "c2" = $2 WHERE "k1" = $3 AND "k2" = $4
/// ```
/// Parameters are the SET values followed by the key values.
pub fn build_update_query(
    dialect: Dialect,
    table: &TableName,
    set_columns: &[String],
    key_columns: &[String],
) -> String {
    let assignments: Vec<String> = set_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = {}", quote_ident(c), dialect.placeholder(i + 1)))
        .collect();
    format!(
        "UPDATE {} SET {} WHERE {}",
        table.quoted(),
        assignments.join(", "),
        key_predicate(dialect, key_columns, set_columns.len() + 1)
    )
}

pub fn build_delete_query(dialect: Dialect, table: &TableName, key_columns: &[String]) -> String {
    format!(
        "DELETE FROM {} WHERE {}",
        table.quoted(),
        key_predicate(dialect, key_columns, 1)
    )
}
