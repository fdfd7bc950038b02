// ABOUTME: Read-side collaborator traits of the sync engine
// ABOUTME: Change feed, primary-key resolution and per-key view slice fetching

use anyhow::Result;

use super::types::{ChangeKey, ChangeSet, TableName, ViewSlice, Watermark};

/// Enumerates keys that changed in the source since a watermark.
///
/// Together, `current_watermark` followed by `changed_keys(since)` form the
/// feed's `GetChanges` operation. The engine probes the ceiling first so that
/// anything changing during the scan is reported again on the next run.
#[allow(async_fn_in_trait)]
pub trait ChangeFeedSource {
    /// Snapshot of the feed's sequence counter.
    async fn current_watermark(&self) -> Result<Watermark>;

    /// Every key whose data changed strictly after `since`.
    ///
    /// Duplicates are allowed; the engine drops them.
    async fn changed_keys(&self, since: Watermark) -> Result<ChangeSet>;
}

/// Looks up the ordered primary-key columns of a table.
#[allow(async_fn_in_trait)]
pub trait KeyColumnResolver {
    /// Returns an empty list when the table has no primary key.
    async fn resolve_primary_key(&self, table: &TableName) -> Result<Vec<String>>;
}

/// Re-reads the source view for a single key.
#[allow(async_fn_in_trait)]
pub trait ViewSliceFetcher {
    /// Rows of the view matching `key` by equality on every key column.
    ///
    /// Implementations may stop reading after the second row; the engine
    /// treats anything beyond one row as an integrity error.
    async fn fetch_slice(&self, key: &ChangeKey) -> Result<Vec<ViewSlice>>;

    /// SQL text (or equivalent description) of the per-key lookup.
    fn query_shape(&self, key_columns: &[String]) -> String;
}

impl<T: ChangeFeedSource + ?Sized> ChangeFeedSource for &T {
    async fn current_watermark(&self) -> Result<Watermark> {
        (**self).current_watermark().await
    }

    async fn changed_keys(&self, since: Watermark) -> Result<ChangeSet> {
        (**self).changed_keys(since).await
    }
}

impl<T: KeyColumnResolver + ?Sized> KeyColumnResolver for &T {
    async fn resolve_primary_key(&self, table: &TableName) -> Result<Vec<String>> {
        (**self).resolve_primary_key(table).await
    }
}

impl<T: ViewSliceFetcher + ?Sized> ViewSliceFetcher for &T {
    async fn fetch_slice(&self, key: &ChangeKey) -> Result<Vec<ViewSlice>> {
        (**self).fetch_slice(key).await
    }

    fn query_shape(&self, key_columns: &[String]) -> String {
        (**self).query_shape(key_columns)
    }
}
