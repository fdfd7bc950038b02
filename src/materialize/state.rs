// ABOUTME: VersionStore - durable home of the last committed watermark per target
// ABOUTME: Provides a JSON-file store and an in-memory store

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;

use super::types::Watermark;

/// Key-value store holding the last committed watermark.
///
/// Absence of a value means "never synced".
#[allow(async_fn_in_trait)]
pub trait VersionStore {
    async fn get(&self, key: &str) -> Result<Option<Watermark>>;
    async fn set(&self, key: &str, watermark: Watermark) -> Result<()>;
}

impl<T: VersionStore + ?Sized> VersionStore for &T {
    async fn get(&self, key: &str) -> Result<Option<Watermark>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, watermark: Watermark) -> Result<()> {
        (**self).set(key, watermark).await
    }
}

/// Process-local store, mainly for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryVersionStore {
    values: Mutex<HashMap<String, Watermark>>,
}

impl MemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous peek, handy in assertions.
    pub fn snapshot(&self, key: &str) -> Option<Watermark> {
        self.values
            .lock()
            .ok()
            .and_then(|values| values.get(key).copied())
    }
}

impl VersionStore for MemoryVersionStore {
    async fn get(&self, key: &str) -> Result<Option<Watermark>> {
        let values = self
            .values
            .lock()
            .map_err(|_| anyhow!("version store lock poisoned"))?;
        Ok(values.get(key).copied())
    }

    async fn set(&self, key: &str, watermark: Watermark) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| anyhow!("version store lock poisoned"))?;
        values.insert(key.to_string(), watermark);
        Ok(())
    }
}

/// One committed watermark and when it was written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkEntry {
    pub watermark: Watermark,
    pub committed_at: chrono::DateTime<chrono::Utc>,
}

/// On-disk layout of the JSON watermark file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkFile {
    /// Version of the file format for future migrations
    pub version: u32,
    pub entries: BTreeMap<String, WatermarkEntry>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl WatermarkFile {
    pub fn new() -> Self {
        let now = chrono::Utc::now();
        Self {
            version: 1,
            entries: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn record(&mut self, key: &str, watermark: Watermark) {
        let now = chrono::Utc::now();
        self.entries.insert(
            key.to_string(),
            WatermarkEntry {
                watermark,
                committed_at: now,
            },
        );
        self.updated_at = now;
    }

    /// Load the file; a missing file is an empty store.
    pub async fn load(path: &Path) -> Result<Self> {
        let exists = fs::try_exists(path)
            .await
            .with_context(|| format!("Failed to check watermark file {:?}", path))?;
        if !exists {
            return Ok(Self::new());
        }
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read watermark file {:?}", path))?;
        let file: WatermarkFile = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse watermark file {:?}", path))?;
        Ok(file)
    }

    /// Save via write-then-rename so a crash never leaves a torn file.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize watermark file")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents)
            .await
            .with_context(|| format!("Failed to write watermark file {:?}", tmp))?;
        fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to replace watermark file {:?}", path))?;
        Ok(())
    }
}

impl Default for WatermarkFile {
    fn default() -> Self {
        Self::new()
    }
}

/// Watermarks persisted in a JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileVersionStore {
    path: PathBuf,
}

impl JsonFileVersionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Default file location relative to the working directory.
    pub fn default_path() -> PathBuf {
        PathBuf::from(".view-materializer/watermarks.json")
    }
}

impl VersionStore for JsonFileVersionStore {
    async fn get(&self, key: &str) -> Result<Option<Watermark>> {
        let file = WatermarkFile::load(&self.path).await?;
        Ok(file.entries.get(key).map(|entry| entry.watermark))
    }

    async fn set(&self, key: &str, watermark: Watermark) -> Result<()> {
        let mut file = WatermarkFile::load(&self.path).await?;
        file.record(key, watermark);
        file.save(&self.path).await
    }
}
