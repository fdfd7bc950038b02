// ABOUTME: SyncError - failure taxonomy of a materialization run
// ABOUTME: Separates fatal schema/integrity errors from retryable store errors

use thiserror::Error;

use super::engine::SyncPhase;
use crate::value::DecodeError;

/// Why an `execute` call failed. In every case the watermark is left untouched.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The change feed's columns are not the target's primary key.
    #[error(
        "changed-key columns [{}] do not match primary key {} of {}",
        .changed.join(", "),
        .primary_key,
        .table
    )]
    SchemaMismatch {
        changed: Vec<String>,
        primary_key: String,
        table: String,
    },

    #[error("target table {table} has no primary key")]
    MissingPrimaryKey { table: String },

    /// The source view returned more than one row for a single key.
    #[error("source view returned {rows} rows for key {key} ({query}); expected at most one")]
    SliceIntegrity {
        query: String,
        key: String,
        rows: usize,
    },

    /// The change-tracking ceiling could not be read and the engine is
    /// configured not to fall back to a full resync.
    #[error("failed to read current change-tracking version: {source:#}")]
    VersionProbe {
        #[source]
        source: anyhow::Error,
    },

    /// A source value that cannot be represented. Re-running reads the same
    /// value, so this needs a schema or view change before it can succeed.
    #[error(
        "{phase} failed: {source:#}; sync not committed, fix the column type before retrying"
    )]
    Decode {
        phase: SyncPhase,
        #[source]
        source: anyhow::Error,
    },

    /// Any database error while reading, fetching, merging or committing.
    #[error("{phase} failed: {source:#}; sync not committed, safe to retry")]
    Store {
        phase: SyncPhase,
        #[source]
        source: anyhow::Error,
    },
}

impl SyncError {
    /// Wrap a collaborator error, separating undecodable values from
    /// transient failures.
    pub(crate) fn store(phase: SyncPhase, source: anyhow::Error) -> Self {
        if source.chain().any(|e| e.is::<DecodeError>()) {
            SyncError::Decode { phase, source }
        } else {
            SyncError::Store { phase, source }
        }
    }

    /// True for errors where re-running the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Store { .. } | SyncError::VersionProbe { .. })
    }
}
