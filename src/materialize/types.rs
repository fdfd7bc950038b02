// ABOUTME: Core data model for view materialization - watermarks, keys, slices
// ABOUTME: Also holds TableName, the validated [schema.]name identifier

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::utils::{quote_ident, validate_identifier};
use crate::value::SqlValue;

/// Position in the source's change history.
///
/// Only meaningful to the change feed that produced it; zero is the
/// "beginning of history" sentinel.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Watermark(pub i64);

impl Watermark {
    pub const BEGINNING: Watermark = Watermark(0);

    pub fn value(self) -> i64 {
        self.0
    }

    pub fn is_beginning(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Watermark {
    fn from(v: i64) -> Self {
        Watermark(v)
    }
}

/// Database object identifier in `[schema.]name` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub schema: Option<String>,
    pub name: String,
}

impl TableName {
    pub fn new(schema: Option<&str>, name: &str) -> Result<Self> {
        if let Some(schema) = schema {
            validate_identifier(schema)?;
        }
        validate_identifier(name)?;
        Ok(Self {
            schema: schema.map(|s| s.trim().to_string()),
            name: name.trim().to_string(),
        })
    }

    pub fn parse(qualified: &str) -> Result<Self> {
        let parts: Vec<&str> = qualified.split('.').collect();
        match parts.as_slice() {
            [name] => Self::new(None, name),
            [schema, name] => Self::new(Some(*schema), name),
            _ => bail!(
                "Invalid object name '{}': expected 'name' or 'schema.name'",
                crate::utils::sanitize_identifier(qualified)
            ),
        }
    }

    /// Schema, falling back to the backend's default when unqualified.
    pub fn schema_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.schema.as_deref().unwrap_or(default)
    }

    /// Quoted form suitable for splicing into SQL text.
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for TableName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Ordered primary-key column names of the target table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyColumnSet {
    columns: Vec<String>,
}

impl KeyColumnSet {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c.eq_ignore_ascii_case(column))
    }

    /// Case-insensitive, order-independent set equality.
    pub fn matches<S: AsRef<str>>(&self, columns: &[S]) -> bool {
        let mut ours: Vec<String> = self.columns.iter().map(|c| c.to_ascii_lowercase()).collect();
        let mut theirs: Vec<String> = columns.iter().map(|c| c.as_ref().to_ascii_lowercase()).collect();
        ours.sort();
        ours.dedup();
        theirs.sort();
        theirs.dedup();
        ours.len() == self.columns.len() && theirs.len() == columns.len() && ours == theirs
    }
}

impl fmt::Display for KeyColumnSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.columns.join(", "))
    }
}

/// Primary-key tuple of one changed row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeKey {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl ChangeKey {
    pub fn new(pairs: Vec<(String, SqlValue)>) -> Self {
        let (columns, values) = pairs.into_iter().unzip();
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .map(|idx| &self.values[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    /// Reorder into the target's primary-key order, using its column spelling.
    ///
    /// Returns `None` when a key column is missing from this key.
    pub fn align_to(&self, key_columns: &KeyColumnSet) -> Option<ChangeKey> {
        let mut pairs = Vec::with_capacity(key_columns.len());
        for column in key_columns.columns() {
            pairs.push((column.clone(), self.get(column)?.clone()));
        }
        Some(ChangeKey::new(pairs))
    }
}

impl fmt::Display for ChangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (column, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", column, value)?;
        }
        f.write_str("}")
    }
}

/// Result of one change-feed scan.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    /// Column names of the feed's result, known even when no rows changed.
    pub columns: Vec<String>,
    pub keys: Vec<ChangeKey>,
}

/// One row of the source view.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewSlice {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl ViewSlice {
    pub fn new(pairs: Vec<(String, SqlValue)>) -> Self {
        let (columns, values) = pairs.into_iter().unzip();
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .map(|idx| &self.values[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    /// Columns that are not part of the key, in slice order.
    pub fn non_key<'a>(
        &'a self,
        key_columns: &'a [String],
    ) -> impl Iterator<Item = (&'a str, &'a SqlValue)> + 'a {
        self.iter()
            .filter(move |(c, _)| !key_columns.iter().any(|k| k.eq_ignore_ascii_case(c)))
    }
}

/// What the merger did with one slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    /// Row exists and the slice carries no non-key columns.
    Unchanged,
}
