// ABOUTME: Write-side collaborator trait of the sync engine
// ABOUTME: The only component allowed to mutate the target table

use anyhow::Result;

use super::types::{ChangeKey, MergeOutcome, ViewSlice};

/// Reconciles one view slice into the target table.
///
/// `key` is already aligned to the target's primary-key order and spelling.
/// Every statement must be parameterized.
#[allow(async_fn_in_trait)]
pub trait TargetMerger {
    /// Update the row matching `key` if it exists, insert `slice` otherwise.
    ///
    /// Key columns are never updated.
    async fn merge(&self, key: &ChangeKey, slice: &ViewSlice) -> Result<MergeOutcome>;

    /// Delete the row matching `key`. Returns whether a row was removed.
    async fn remove(&self, key: &ChangeKey) -> Result<bool>;
}

impl<T: TargetMerger + ?Sized> TargetMerger for &T {
    async fn merge(&self, key: &ChangeKey, slice: &ViewSlice) -> Result<MergeOutcome> {
        (**self).merge(key, slice).await
    }

    async fn remove(&self, key: &ChangeKey) -> Result<bool> {
        (**self).remove(key).await
    }
}
