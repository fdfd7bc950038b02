// ABOUTME: SyncEngine - incremental view materialization driven by a watermark
// ABOUTME: Reads changed keys, re-fetches their view slices, merges, then commits

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::error::SyncError;
use super::observer::{SliceFetched, SliceObserver};
use super::source::{ChangeFeedSource, KeyColumnResolver, ViewSliceFetcher};
use super::state::VersionStore;
use super::target::TargetMerger;
use super::types::{ChangeKey, KeyColumnSet, MergeOutcome, TableName, Watermark};

/// States of one `execute` call, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    ResolvingWatermark,
    FetchingChanges,
    ResolvingKeyColumns,
    ValidatingKeyColumns,
    PerKeyLoop,
    CommittingWatermark,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncPhase::Idle => "idle",
            SyncPhase::ResolvingWatermark => "resolving watermark",
            SyncPhase::FetchingChanges => "fetching changes",
            SyncPhase::ResolvingKeyColumns => "resolving key columns",
            SyncPhase::ValidatingKeyColumns => "validating key columns",
            SyncPhase::PerKeyLoop => "per-key merge",
            SyncPhase::CommittingWatermark => "committing watermark",
        })
    }
}

/// What to do when a changed key no longer has a row in the source view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingSlicePolicy {
    /// Treat absence as a deletion and remove the target row.
    #[default]
    Delete,
    /// Leave the target row as it is.
    Skip,
}

/// What to do when the change-tracking ceiling cannot be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeFailurePolicy {
    /// Carry on and commit the beginning-of-history watermark, forcing a
    /// full resync on the next run.
    #[default]
    #[serde(rename = "reset")]
    ResetToBeginning,
    /// Abort before touching the target.
    Fail,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Key under which the watermark is stored; defaults to one per target.
    pub version_key: Option<String>,
    pub missing_slice: MissingSlicePolicy,
    pub probe_failure: ProbeFailurePolicy,
    /// Upper bound on keys merged concurrently on the same connection.
    pub max_concurrent_merges: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            version_key: None,
            missing_slice: MissingSlicePolicy::Delete,
            probe_failure: ProbeFailurePolicy::ResetToBeginning,
            max_concurrent_merges: 1,
        }
    }
}

/// Ceiling observed before the per-key loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkProbe {
    Observed(Watermark),
    /// The probe failed and the run fell back to the beginning of history.
    Unavailable,
}

impl WatermarkProbe {
    pub fn ceiling(self) -> Watermark {
        match self {
            WatermarkProbe::Observed(w) => w,
            WatermarkProbe::Unavailable => Watermark::BEGINNING,
        }
    }
}

/// Statistics from one successful `execute` call.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub target: String,
    pub version_key: String,
    /// Watermark stored before the run; `None` on the first ever run.
    pub previous: Option<Watermark>,
    pub committed: Watermark,
    pub probe: WatermarkProbe,
    pub keys_reported: usize,
    pub duplicates: usize,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    /// Keys whose slice was absent from the source view.
    pub missing: u64,
    /// Target rows removed because their slice was absent.
    pub deleted: u64,
    pub elapsed: Duration,
}

impl SyncReport {
    /// Number of distinct keys processed.
    pub fn keys_processed(&self) -> usize {
        self.keys_reported - self.duplicates
    }

    pub fn rows_written(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }
}

enum KeyOutcome {
    Merged(MergeOutcome),
    Missing { deleted: bool },
}

/// Materializes a source view into a target table one changed key at a time.
///
/// A run reads the last committed watermark, probes the feed's current
/// ceiling, fetches the keys changed since the watermark, and for each key
/// re-reads the view slice and merges it into the target. Only when every key
/// has been merged is the ceiling committed, so a failed run is re-run from
/// the same watermark and replays the same (idempotent) diff.
///
/// Concurrent `execute` calls for the same target must be serialized by the
/// caller.
pub struct SyncEngine<F, K, S, M> {
    target: TableName,
    feed: F,
    key_resolver: K,
    slices: S,
    merger: M,
    options: EngineOptions,
    observer: Option<Arc<dyn SliceObserver>>,
}

impl<F, K, S, M> SyncEngine<F, K, S, M> {
    pub fn new(target: TableName, feed: F, key_resolver: K, slices: S, merger: M) -> Self {
        Self {
            target,
            feed,
            key_resolver,
            slices,
            merger,
            options: EngineOptions::default(),
            observer: None,
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SliceObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn target(&self) -> &TableName {
        &self.target
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn version_key(&self) -> String {
        self.options
            .version_key
            .clone()
            .unwrap_or_else(|| default_version_key(&self.target))
    }
}

/// Watermark key used when none is configured.
pub fn default_version_key(target: &TableName) -> String {
    format!("last_sync_version:{}", target)
}

impl<F, K, S, M> SyncEngine<F, K, S, M>
where
    F: ChangeFeedSource,
    K: KeyColumnResolver,
    S: ViewSliceFetcher,
    M: TargetMerger,
{
    /// Run one synchronization pass.
    ///
    /// On error the stored watermark is unchanged; merges already applied
    /// stay applied and are safely replayed by the next run.
    pub async fn execute<V: VersionStore>(&self, store: &V) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        let version_key = self.version_key();

        self.enter(SyncPhase::ResolvingWatermark);
        let previous = store
            .get(&version_key)
            .await
            .map_err(|e| SyncError::store(SyncPhase::ResolvingWatermark, e))?;
        let since = previous.unwrap_or(Watermark::BEGINNING);

        self.enter(SyncPhase::FetchingChanges);
        let probe = self.probe_ceiling().await?;
        let changes = self
            .feed
            .changed_keys(since)
            .await
            .map_err(|e| SyncError::store(SyncPhase::FetchingChanges, e))?;
        let keys_reported = changes.keys.len();

        self.enter(SyncPhase::ResolvingKeyColumns);
        let primary_key = self
            .key_resolver
            .resolve_primary_key(&self.target)
            .await
            .map_err(|e| SyncError::store(SyncPhase::ResolvingKeyColumns, e))?;
        if primary_key.is_empty() {
            return Err(SyncError::MissingPrimaryKey {
                table: self.target.to_string(),
            });
        }
        let key_columns = KeyColumnSet::new(primary_key);

        self.enter(SyncPhase::ValidatingKeyColumns);
        if !key_columns.matches(&changes.columns) {
            return Err(self.mismatch(&changes.columns, &key_columns));
        }
        let keys = self.align_keys(changes.keys, &key_columns)?;
        let duplicates = keys_reported - keys.len();
        if duplicates > 0 {
            tracing::debug!(
                "Dropped {} duplicate key(s) reported for {}",
                duplicates,
                self.target
            );
        }

        self.enter(SyncPhase::PerKeyLoop);
        if !keys.is_empty() {
            tracing::info!(
                "Found {} changed key(s) for {} (watermark {} -> {})",
                keys.len(),
                self.target,
                since,
                probe.ceiling()
            );
        }
        let query = self.slices.query_shape(key_columns.columns());
        let outcomes: Vec<KeyOutcome> = stream::iter(keys.iter())
            .map(|key| self.sync_key(key, &query))
            .buffer_unordered(self.options.max_concurrent_merges.max(1))
            .try_collect()
            .await?;

        self.enter(SyncPhase::CommittingWatermark);
        let committed = probe.ceiling();
        if committed < since {
            tracing::warn!(
                "Watermark for {} moves backwards ({} -> {}); the next run rescans from there",
                self.target,
                since,
                committed
            );
        }
        store
            .set(&version_key, committed)
            .await
            .map_err(|e| SyncError::store(SyncPhase::CommittingWatermark, e))?;
        self.enter(SyncPhase::Idle);

        let mut report = SyncReport {
            target: self.target.to_string(),
            version_key,
            previous,
            committed,
            probe,
            keys_reported,
            duplicates,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            missing: 0,
            deleted: 0,
            elapsed: Duration::ZERO,
        };
        for outcome in outcomes {
            match outcome {
                KeyOutcome::Merged(MergeOutcome::Inserted) => report.inserted += 1,
                KeyOutcome::Merged(MergeOutcome::Updated) => report.updated += 1,
                KeyOutcome::Merged(MergeOutcome::Unchanged) => report.unchanged += 1,
                KeyOutcome::Missing { deleted } => {
                    report.missing += 1;
                    if deleted {
                        report.deleted += 1;
                    }
                }
            }
        }
        report.elapsed = started.elapsed();

        if report.keys_processed() == 0 {
            tracing::debug!("No changes in {} since watermark {}", self.target, since);
        } else {
            tracing::info!(
                "Synced {}: {} inserted, {} updated, {} deleted, {} missing in {:?} (watermark {} -> {})",
                self.target,
                report.inserted,
                report.updated,
                report.deleted,
                report.missing,
                report.elapsed,
                since,
                committed
            );
        }

        Ok(report)
    }

    fn enter(&self, phase: SyncPhase) {
        tracing::debug!("{}: {}", self.target, phase);
    }

    async fn probe_ceiling(&self) -> Result<WatermarkProbe, SyncError> {
        match self.feed.current_watermark().await {
            Ok(watermark) => Ok(WatermarkProbe::Observed(watermark)),
            Err(e) => match self.options.probe_failure {
                ProbeFailurePolicy::Fail => Err(SyncError::VersionProbe { source: e }),
                ProbeFailurePolicy::ResetToBeginning => {
                    tracing::error!(
                        "Failed to read current change-tracking version for {}: {:#}. \
                         Committing watermark {} after this run, which forces a FULL resync next time",
                        self.target,
                        e,
                        Watermark::BEGINNING
                    );
                    Ok(WatermarkProbe::Unavailable)
                }
            },
        }
    }

    fn mismatch<C: AsRef<str>>(&self, changed: &[C], key_columns: &KeyColumnSet) -> SyncError {
        SyncError::SchemaMismatch {
            changed: changed.iter().map(|c| c.as_ref().to_string()).collect(),
            primary_key: key_columns.to_string(),
            table: self.target.to_string(),
        }
    }

    /// Align every key to the primary-key order, dropping repeats.
    fn align_keys(
        &self,
        keys: Vec<ChangeKey>,
        key_columns: &KeyColumnSet,
    ) -> Result<Vec<ChangeKey>, SyncError> {
        let mut seen = HashSet::with_capacity(keys.len());
        let mut aligned = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(key) = key.align_to(key_columns) else {
                return Err(self.mismatch(key.columns(), key_columns));
            };
            if seen.insert(key.clone()) {
                aligned.push(key);
            }
        }
        Ok(aligned)
    }

    async fn sync_key(&self, key: &ChangeKey, query: &str) -> Result<KeyOutcome, SyncError> {
        let started = Instant::now();
        let mut rows = self
            .slices
            .fetch_slice(key)
            .await
            .map_err(|e| SyncError::store(SyncPhase::PerKeyLoop, e))?;

        if let Some(observer) = &self.observer {
            observer.on_slice_fetched(&SliceFetched {
                key,
                query,
                elapsed: started.elapsed(),
                rows: rows.len(),
            });
        }

        if rows.len() > 1 {
            return Err(SyncError::SliceIntegrity {
                query: query.to_string(),
                key: key.to_string(),
                rows: rows.len(),
            });
        }

        match rows.pop() {
            Some(slice) => {
                let outcome = self
                    .merger
                    .merge(key, &slice)
                    .await
                    .map_err(|e| SyncError::store(SyncPhase::PerKeyLoop, e))?;
                tracing::trace!("{:?} {} in {}", outcome, key, self.target);
                Ok(KeyOutcome::Merged(outcome))
            }
            None => match self.options.missing_slice {
                MissingSlicePolicy::Delete => {
                    let deleted = self
                        .merger
                        .remove(key)
                        .await
                        .map_err(|e| SyncError::store(SyncPhase::PerKeyLoop, e))?;
                    tracing::debug!(
                        "Key {} no longer in source view; {}",
                        key,
                        if deleted {
                            "removed target row"
                        } else {
                            "no target row to remove"
                        }
                    );
                    Ok(KeyOutcome::Missing { deleted })
                }
                MissingSlicePolicy::Skip => {
                    tracing::warn!(
                        "Key {} no longer in source view; leaving {} row as-is",
                        key,
                        self.target
                    );
                    Ok(KeyOutcome::Missing { deleted: false })
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::materialize::state::MemoryVersionStore;
    use crate::materialize::types::{ChangeSet, ViewSlice};
    use crate::value::SqlValue;
    use anyhow::{anyhow, bail, Result};
    use std::cell::{Cell, RefCell};
    use std::sync::Mutex;

    const PK: [&str; 3] = ["RegionId", "ItemId", "Date"];

    /// In-memory stand-in for a database holding the change log, the source
    /// view and the target table.
    struct FakeDb {
        primary_key: Vec<String>,
        feed_columns: Vec<String>,
        version: Cell<i64>,
        log: RefCell<Vec<(i64, ChangeKey)>>,
        view: RefCell<Vec<ViewSlice>>,
        target: RefCell<Vec<ViewSlice>>,
        probe_fails: Cell<bool>,
        undecodable_view: Cell<bool>,
        fail_merge_call: Cell<Option<usize>>,
        merge_calls: Cell<usize>,
    }

    impl FakeDb {
        fn new() -> Self {
            Self {
                primary_key: PK.iter().map(|s| s.to_string()).collect(),
                feed_columns: PK.iter().map(|s| s.to_string()).collect(),
                version: Cell::new(0),
                log: RefCell::new(Vec::new()),
                view: RefCell::new(Vec::new()),
                target: RefCell::new(Vec::new()),
                probe_fails: Cell::new(false),
                undecodable_view: Cell::new(false),
                fail_merge_call: Cell::new(None),
                merge_calls: Cell::new(0),
            }
        }

        /// Upsert a view row and record the change at the next version.
        fn put(&self, region: i32, item: i32, date: &str, quantity: i32) {
            let row = sales(region, item, date, quantity);
            let key = sales_key(region, item, date);
            let mut view = self.view.borrow_mut();
            view.retain(|r| !matches_key(r, &key));
            view.push(row);
            self.touch(key);
        }

        /// Remove a view row and record the change.
        fn delete(&self, region: i32, item: i32, date: &str) {
            let key = sales_key(region, item, date);
            self.view.borrow_mut().retain(|r| !matches_key(r, &key));
            self.touch(key);
        }

        fn touch(&self, key: ChangeKey) {
            let version = self.version.get() + 1;
            self.version.set(version);
            self.log.borrow_mut().push((version, key));
        }

        fn target_row(&self, region: i32, item: i32, date: &str) -> Option<ViewSlice> {
            let key = sales_key(region, item, date);
            self.target
                .borrow()
                .iter()
                .find(|r| matches_key(r, &key))
                .cloned()
        }
    }

    fn sales(region: i32, item: i32, date: &str, quantity: i32) -> ViewSlice {
        ViewSlice::new(vec![
            ("RegionId".into(), SqlValue::Int(region)),
            ("ItemId".into(), SqlValue::Int(item)),
            ("Date".into(), SqlValue::Text(date.into())),
            ("Quantity".into(), SqlValue::Int(quantity)),
        ])
    }

    fn sales_key(region: i32, item: i32, date: &str) -> ChangeKey {
        ChangeKey::new(vec![
            ("RegionId".into(), SqlValue::Int(region)),
            ("ItemId".into(), SqlValue::Int(item)),
            ("Date".into(), SqlValue::Text(date.into())),
        ])
    }

    fn matches_key(row: &ViewSlice, key: &ChangeKey) -> bool {
        key.iter().all(|(c, v)| row.get(c) == Some(v))
    }

    impl ChangeFeedSource for FakeDb {
        async fn current_watermark(&self) -> Result<Watermark> {
            if self.probe_fails.get() {
                bail!("change tracking is not enabled");
            }
            Ok(Watermark(self.version.get()))
        }

        async fn changed_keys(&self, since: Watermark) -> Result<ChangeSet> {
            Ok(ChangeSet {
                columns: self.feed_columns.clone(),
                keys: self
                    .log
                    .borrow()
                    .iter()
                    .filter(|(v, _)| *v > since.value())
                    .map(|(_, k)| k.clone())
                    .collect(),
            })
        }
    }

    impl KeyColumnResolver for FakeDb {
        async fn resolve_primary_key(&self, _table: &TableName) -> Result<Vec<String>> {
            Ok(self.primary_key.clone())
        }
    }

    impl ViewSliceFetcher for FakeDb {
        async fn fetch_slice(&self, key: &ChangeKey) -> Result<Vec<ViewSlice>> {
            if self.undecodable_view.get() {
                return Err(anyhow::Error::new(crate::value::DecodeError {
                    ty: "money".into(),
                    reason: "no conversion".into(),
                })
                .context("Failed to decode column 'Price'"));
            }
            Ok(self
                .view
                .borrow()
                .iter()
                .filter(|r| matches_key(r, key))
                .cloned()
                .collect())
        }

        fn query_shape(&self, key_columns: &[String]) -> String {
            format!("SELECT * FROM sales_pivot WHERE {}", key_columns.join(" AND "))
        }
    }

    impl TargetMerger for FakeDb {
        async fn merge(&self, key: &ChangeKey, slice: &ViewSlice) -> Result<MergeOutcome> {
            let call = self.merge_calls.get() + 1;
            self.merge_calls.set(call);
            if self.fail_merge_call.get() == Some(call) {
                return Err(anyhow!("deadlock victim"));
            }

            let mut target = self.target.borrow_mut();
            match target.iter_mut().find(|r| matches_key(r, key)) {
                Some(existing) => {
                    let mut pairs: Vec<(String, SqlValue)> = existing
                        .iter()
                        .map(|(c, v)| (c.to_string(), v.clone()))
                        .collect();
                    for (column, value) in slice.non_key(key.columns()) {
                        if let Some(pair) =
                            pairs.iter_mut().find(|(c, _)| c.eq_ignore_ascii_case(column))
                        {
                            pair.1 = value.clone();
                        }
                    }
                    *existing = ViewSlice::new(pairs);
                    Ok(MergeOutcome::Updated)
                }
                None => {
                    target.push(slice.clone());
                    Ok(MergeOutcome::Inserted)
                }
            }
        }

        async fn remove(&self, key: &ChangeKey) -> Result<bool> {
            let mut target = self.target.borrow_mut();
            let before = target.len();
            target.retain(|r| !matches_key(r, key));
            Ok(target.len() < before)
        }
    }

    fn engine(db: &FakeDb) -> SyncEngine<&FakeDb, &FakeDb, &FakeDb, &FakeDb> {
        SyncEngine::new(TableName::parse("rpt.Sales").unwrap(), db, db, db, db)
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<(String, String, usize)>>,
    }

    impl SliceObserver for RecordingObserver {
        fn on_slice_fetched(&self, event: &SliceFetched<'_>) {
            self.events.lock().unwrap().push((
                event.key.to_string(),
                event.query.to_string(),
                event.rows,
            ));
        }
    }

    #[tokio::test]
    async fn test_sales_scenario_inserts_then_is_idempotent() {
        let db = FakeDb::new();
        db.version.set(10);
        let store = MemoryVersionStore::new();
        let engine = engine(&db);
        store
            .set(&engine.version_key(), Watermark(10))
            .await
            .unwrap();

        db.put(1, 7, "2020-01-01", 42);
        assert_eq!(db.version.get(), 11);

        let report = engine.execute(&store).await.unwrap();
        assert_eq!(report.previous, Some(Watermark(10)));
        assert_eq!(report.committed, Watermark(11));
        assert_eq!(report.probe, WatermarkProbe::Observed(Watermark(11)));
        assert_eq!(report.inserted, 1);
        assert_eq!(report.updated, 0);
        assert_eq!(db.target_row(1, 7, "2020-01-01"), Some(sales(1, 7, "2020-01-01", 42)));
        assert_eq!(store.snapshot(&engine.version_key()), Some(Watermark(11)));

        let again = engine.execute(&store).await.unwrap();
        assert_eq!(again.keys_reported, 0);
        assert_eq!(again.rows_written(), 0);
        assert_eq!(again.committed, Watermark(11));
        assert_eq!(db.target.borrow().len(), 1);
        assert_eq!(store.snapshot(&engine.version_key()), Some(Watermark(11)));
    }

    #[tokio::test]
    async fn test_update_leaves_key_columns_unchanged() {
        let db = FakeDb::new();
        db.target.borrow_mut().push(sales(1, 7, "2020-01-01", 1));
        db.put(1, 7, "2020-01-01", 42);
        let store = MemoryVersionStore::new();

        let report = engine(&db).execute(&store).await.unwrap();
        assert_eq!(report.inserted, 0);
        assert_eq!(report.updated, 1);
        assert_eq!(db.target.borrow().len(), 1);
        let row = db.target_row(1, 7, "2020-01-01").unwrap();
        assert_eq!(row.get("Quantity"), Some(&SqlValue::Int(42)));
        assert_eq!(row.get("RegionId"), Some(&SqlValue::Int(1)));
    }

    #[tokio::test]
    async fn test_first_run_starts_from_beginning() {
        let db = FakeDb::new();
        db.put(1, 1, "2020-01-01", 1);
        db.put(1, 2, "2020-01-01", 2);
        let store = MemoryVersionStore::new();

        let report = engine(&db).execute(&store).await.unwrap();
        assert_eq!(report.previous, None);
        assert_eq!(report.inserted, 2);
        assert_eq!(report.committed, Watermark(2));
    }

    #[tokio::test]
    async fn test_key_column_mismatch_fails_before_touching_rows() {
        let mut db = FakeDb::new();
        db.primary_key = vec!["A".into(), "C".into()];
        db.feed_columns = vec!["A".into(), "B".into()];
        db.put(1, 7, "2020-01-01", 42);
        let store = MemoryVersionStore::new();

        let err = engine(&db).execute(&store).await.unwrap_err();
        match &err {
            SyncError::SchemaMismatch {
                changed,
                primary_key,
                table,
            } => {
                assert_eq!(changed, &vec!["A".to_string(), "B".to_string()]);
                assert_eq!(primary_key, "{A, C}");
                assert_eq!(table, "rpt.Sales");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!err.is_retryable());
        assert!(db.target.borrow().is_empty());
        assert_eq!(db.merge_calls.get(), 0);
        assert_eq!(store.snapshot("last_sync_version:rpt.Sales"), None);
    }

    #[tokio::test]
    async fn test_key_columns_compare_case_insensitively() {
        let mut db = FakeDb::new();
        db.feed_columns = vec!["date".into(), "regionid".into(), "ITEMID".into()];
        db.put(1, 7, "2020-01-01", 42);

        let report = engine(&db).execute(&MemoryVersionStore::new()).await.unwrap();
        assert_eq!(report.inserted, 1);
    }

    #[tokio::test]
    async fn test_missing_primary_key_is_schema_error() {
        let mut db = FakeDb::new();
        db.primary_key.clear();
        db.put(1, 7, "2020-01-01", 42);

        let err = engine(&db)
            .execute(&MemoryVersionStore::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::MissingPrimaryKey { ref table } if table == "rpt.Sales"));
    }

    #[tokio::test]
    async fn test_failure_mid_batch_leaves_watermark_and_replays_whole_batch() {
        let db = FakeDb::new();
        for item in 1..=5 {
            db.put(1, item, "2020-01-01", item * 10);
        }
        let store = MemoryVersionStore::new();
        let engine = engine(&db);
        db.fail_merge_call.set(Some(3));

        let err = engine.execute(&store).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("deadlock victim"));
        assert!(err.to_string().contains("safe to retry"));
        assert_eq!(store.snapshot(&engine.version_key()), None);
        assert_eq!(db.target.borrow().len(), 2);

        db.fail_merge_call.set(None);
        let report = engine.execute(&store).await.unwrap();
        assert_eq!(report.keys_reported, 5);
        assert_eq!(report.inserted, 3);
        assert_eq!(report.updated, 2);
        assert_eq!(db.target.borrow().len(), 5);
        assert_eq!(store.snapshot(&engine.version_key()), Some(Watermark(5)));
    }

    #[tokio::test]
    async fn test_undecodable_slice_is_fatal_and_uncommitted() {
        let db = FakeDb::new();
        db.put(1, 7, "2020-01-01", 42);
        db.undecodable_view.set(true);
        let store = MemoryVersionStore::new();
        let engine = engine(&db);

        let err = engine.execute(&store).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Decode {
                phase: SyncPhase::PerKeyLoop,
                ..
            }
        ));
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Price"));
        assert_eq!(db.merge_calls.get(), 0);
        assert_eq!(store.snapshot(&engine.version_key()), None);
    }

    #[tokio::test]
    async fn test_probe_failure_resets_to_beginning_by_default() {
        let db = FakeDb::new();
        db.put(1, 7, "2020-01-01", 42);
        db.probe_fails.set(true);
        let store = MemoryVersionStore::new();
        let engine = engine(&db);
        store.set(&engine.version_key(), Watermark(0)).await.unwrap();

        let report = engine.execute(&store).await.unwrap();
        assert_eq!(report.probe, WatermarkProbe::Unavailable);
        assert_eq!(report.committed, Watermark::BEGINNING);
        assert_eq!(report.inserted, 1);
        assert_eq!(store.snapshot(&engine.version_key()), Some(Watermark(0)));
    }

    #[tokio::test]
    async fn test_probe_failure_can_abort() {
        let db = FakeDb::new();
        db.put(1, 7, "2020-01-01", 42);
        db.probe_fails.set(true);
        let store = MemoryVersionStore::new();
        let engine = engine(&db).with_options(EngineOptions {
            probe_failure: ProbeFailurePolicy::Fail,
            ..EngineOptions::default()
        });

        let err = engine.execute(&store).await.unwrap_err();
        assert!(matches!(err, SyncError::VersionProbe { .. }));
        assert!(db.target.borrow().is_empty());
        assert_eq!(store.snapshot(&engine.version_key()), None);
    }

    #[tokio::test]
    async fn test_missing_slice_deletes_target_row() {
        let db = FakeDb::new();
        db.put(1, 7, "2020-01-01", 42);
        let store = MemoryVersionStore::new();
        let engine = engine(&db);
        engine.execute(&store).await.unwrap();
        assert!(db.target_row(1, 7, "2020-01-01").is_some());

        db.delete(1, 7, "2020-01-01");
        let report = engine.execute(&store).await.unwrap();
        assert_eq!(report.missing, 1);
        assert_eq!(report.deleted, 1);
        assert!(db.target_row(1, 7, "2020-01-01").is_none());
    }

    #[tokio::test]
    async fn test_missing_slice_skip_keeps_target_row() {
        let db = FakeDb::new();
        db.target.borrow_mut().push(sales(1, 7, "2020-01-01", 42));
        db.delete(1, 7, "2020-01-01");
        let engine = engine(&db).with_options(EngineOptions {
            missing_slice: MissingSlicePolicy::Skip,
            ..EngineOptions::default()
        });

        let report = engine.execute(&MemoryVersionStore::new()).await.unwrap();
        assert_eq!(report.missing, 1);
        assert_eq!(report.deleted, 0);
        assert!(db.target_row(1, 7, "2020-01-01").is_some());
    }

    #[tokio::test]
    async fn test_duplicate_view_rows_are_an_integrity_error() {
        let db = FakeDb::new();
        db.put(1, 7, "2020-01-01", 42);
        db.view.borrow_mut().push(sales(1, 7, "2020-01-01", 43));
        let store = MemoryVersionStore::new();
        let engine = engine(&db);

        let err = engine.execute(&store).await.unwrap_err();
        match err {
            SyncError::SliceIntegrity { rows, key, query } => {
                assert_eq!(rows, 2);
                assert!(key.contains("RegionId: 1"));
                assert!(query.contains("sales_pivot"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(db.target.borrow().is_empty());
        assert_eq!(store.snapshot(&engine.version_key()), None);
    }

    #[tokio::test]
    async fn test_duplicate_keys_are_merged_once() {
        let db = FakeDb::new();
        db.put(1, 7, "2020-01-01", 41);
        db.put(1, 7, "2020-01-01", 42);

        let report = engine(&db).execute(&MemoryVersionStore::new()).await.unwrap();
        assert_eq!(report.keys_reported, 2);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.keys_processed(), 1);
        assert_eq!(db.merge_calls.get(), 1);
        assert_eq!(db.target_row(1, 7, "2020-01-01"), Some(sales(1, 7, "2020-01-01", 42)));
    }

    #[tokio::test]
    async fn test_observer_sees_every_fetch() {
        let db = FakeDb::new();
        db.put(1, 1, "2020-01-01", 1);
        db.put(1, 2, "2020-01-01", 2);
        let observer = Arc::new(RecordingObserver::default());
        let engine = engine(&db).with_observer(observer.clone());

        engine.execute(&MemoryVersionStore::new()).await.unwrap();
        let events = observer.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|(_, q, rows)| q.contains("RegionId AND ItemId AND Date") && *rows == 1));
    }

    #[tokio::test]
    async fn test_concurrent_merges_converge() {
        let db = FakeDb::new();
        for item in 1..=20 {
            db.put(2, item, "2021-06-30", item);
        }
        let engine = engine(&db).with_options(EngineOptions {
            max_concurrent_merges: 4,
            ..EngineOptions::default()
        });

        let report = engine.execute(&MemoryVersionStore::new()).await.unwrap();
        assert_eq!(report.inserted, 20);
        for item in 1..=20 {
            assert_eq!(
                db.target_row(2, item, "2021-06-30"),
                Some(sales(2, item, "2021-06-30", item))
            );
        }
    }

    #[test]
    fn test_version_key_defaults_per_target() {
        let db = FakeDb::new();
        assert_eq!(engine(&db).version_key(), "last_sync_version:rpt.Sales");
        let custom = engine(&db).with_options(EngineOptions {
            version_key: Some("LastSyncVersion".into()),
            ..EngineOptions::default()
        });
        assert_eq!(custom.version_key(), "LastSyncVersion");
    }

    #[test]
    fn test_policies_deserialize_from_config_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            missing: MissingSlicePolicy,
            probe: ProbeFailurePolicy,
        }
        let w: Wrapper = toml::from_str("missing = \"skip\"\nprobe = \"reset\"").unwrap();
        assert_eq!(w.missing, MissingSlicePolicy::Skip);
        assert_eq!(w.probe, ProbeFailurePolicy::ResetToBeginning);
        let w: Wrapper = toml::from_str("missing = \"delete\"\nprobe = \"fail\"").unwrap();
        assert_eq!(w.missing, MissingSlicePolicy::Delete);
        assert_eq!(w.probe, ProbeFailurePolicy::Fail);
    }
}
