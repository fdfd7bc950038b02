// ABOUTME: Cache of prepared statements keyed by SQL text
// ABOUTME: Each distinct query shape is prepared once per connection

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio_postgres::{Client, Statement};

#[derive(Debug, Default)]
pub struct StatementCache {
    statements: Mutex<HashMap<String, Statement>>,
}

impl StatementCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached statement for `sql`, preparing it on first use.
    pub async fn prepare(&self, client: &Client, sql: &str) -> Result<Statement> {
        if let Some(statement) = self.lock()?.get(sql) {
            return Ok(statement.clone());
        }

        let statement = client
            .prepare(sql)
            .await
            .with_context(|| format!("Failed to prepare statement: {}", sql))?;
        self.lock()?.insert(sql.to_string(), statement.clone());
        Ok(statement)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Statement>>> {
        self.statements
            .lock()
            .map_err(|_| anyhow!("statement cache lock poisoned"))
    }
}
