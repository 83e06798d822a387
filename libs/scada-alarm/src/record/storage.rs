//! Record storage backends
//!
//! `JsonFileStorage` lays records out as `{base}/{YYYY-MM-DD}/{record_id}.json`
//! and keeps an in-memory index that is rebuilt from disk on open.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use scada_model::AlarmLevel;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::types::{AlarmRecord, QueryResult, RecordQuery, RecordStats};
use crate::error::{AlarmError, Result};

/// Pluggable record persistence
#[async_trait]
pub trait RecordStorage: Send + Sync + 'static {
    async fn save(&self, records: &[AlarmRecord]) -> Result<()>;

    async fn get(&self, record_id: &str) -> Result<Option<AlarmRecord>>;

    async fn query(&self, query: &RecordQuery) -> Result<QueryResult>;

    async fn delete(&self, record_id: &str) -> Result<bool>;

    /// Remove records triggered before `cutoff`, returning how many went
    async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    async fn stats(&self) -> Result<RecordStats>;
}

// ============================================================================
// Index
// ============================================================================

#[derive(Default)]
struct RecordIndex {
    records: FxHashMap<String, AlarmRecord>,
    by_rule: FxHashMap<String, FxHashSet<String>>,
    by_level: FxHashMap<AlarmLevel, FxHashSet<String>>,
    by_category: FxHashMap<String, FxHashSet<String>>,
    by_date: FxHashMap<NaiveDate, FxHashSet<String>>,
    /// (trigger_time, id), newest first
    by_time: Vec<(DateTime<Utc>, String)>,
}

impl RecordIndex {
    fn insert(&mut self, record: AlarmRecord) {
        if self.records.contains_key(&record.id) {
            self.remove(&record.id.clone());
        }
        let id = record.id.clone();
        self.by_rule
            .entry(record.rule_id.clone())
            .or_default()
            .insert(id.clone());
        self.by_level.entry(record.level).or_default().insert(id.clone());
        self.by_category
            .entry(record.category.clone())
            .or_default()
            .insert(id.clone());
        self.by_date
            .entry(record.trigger_time.date_naive())
            .or_default()
            .insert(id.clone());
        let key = (record.trigger_time, id.clone());
        let pos = self
            .by_time
            .partition_point(|(t, i)| (t, i) > (&key.0, &key.1));
        self.by_time.insert(pos, key);
        self.records.insert(id, record);
    }

    fn remove(&mut self, id: &str) -> Option<AlarmRecord> {
        let record = self.records.remove(id)?;
        prune(&mut self.by_rule, &record.rule_id, id);
        prune(&mut self.by_level, &record.level, id);
        prune(&mut self.by_category, &record.category, id);
        prune(&mut self.by_date, &record.trigger_time.date_naive(), id);
        self.by_time.retain(|(_, i)| i != id);
        Some(record)
    }

    /// Narrowest candidate set for the query
    fn candidates(&self, query: &RecordQuery) -> Vec<&AlarmRecord> {
        let pick = |ids: &FxHashSet<String>| -> Vec<&AlarmRecord> {
            ids.iter().filter_map(|id| self.records.get(id)).collect()
        };

        if !query.rule_ids.is_empty() {
            let mut out = Vec::new();
            for rule in &query.rule_ids {
                if let Some(ids) = self.by_rule.get(rule) {
                    out.extend(pick(ids));
                }
            }
            return out;
        }
        if !query.levels.is_empty() {
            let mut out = Vec::new();
            for level in &query.levels {
                if let Some(ids) = self.by_level.get(level) {
                    out.extend(pick(ids));
                }
            }
            return out;
        }
        if !query.categories.is_empty() {
            let mut out = Vec::new();
            for category in &query.categories {
                if let Some(ids) = self.by_category.get(category) {
                    out.extend(pick(ids));
                }
            }
            return out;
        }
        self.by_time
            .iter()
            .filter_map(|(_, id)| self.records.get(id))
            .collect()
    }
}

fn prune<K: std::hash::Hash + Eq + Clone>(map: &mut FxHashMap<K, FxHashSet<String>>, key: &K, id: &str) {
    if let Some(ids) = map.get_mut(key) {
        ids.remove(id);
        if ids.is_empty() {
            map.remove(key);
        }
    }
}

// ============================================================================
// JSON File Storage
// ============================================================================

pub struct JsonFileStorage {
    base_path: PathBuf,
    index: RwLock<RecordIndex>,
}

impl JsonFileStorage {
    /// Open (creating if needed) and index every record under `base_path`
    pub async fn open(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&base_path).await?;

        let storage = Self {
            base_path,
            index: RwLock::new(RecordIndex::default()),
        };
        let loaded = storage.rebuild_index().await?;
        info!(
            "Record storage opened at {}: {} records",
            storage.base_path.display(),
            loaded
        );
        Ok(storage)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn len(&self) -> usize {
        self.index.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn date_dir(&self, time: DateTime<Utc>) -> PathBuf {
        self.base_path.join(time.format("%Y-%m-%d").to_string())
    }

    fn record_path(&self, record: &AlarmRecord) -> PathBuf {
        self.date_dir(record.trigger_time)
            .join(format!("{}.json", record.id))
    }

    async fn rebuild_index(&self) -> Result<usize> {
        let mut loaded = Vec::new();
        let mut days = tokio::fs::read_dir(&self.base_path).await?;
        while let Some(day) = days.next_entry().await? {
            if !day.file_type().await?.is_dir() {
                continue;
            }
            let mut files = tokio::fs::read_dir(day.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match load_record(&path).await {
                    Ok(mut record) => {
                        record.storage_path = Some(path.display().to_string());
                        loaded.push(record);
                    },
                    Err(e) => warn!("Skipping unreadable record {}: {}", path.display(), e),
                }
            }
        }

        let count = loaded.len();
        let mut index = self.index.write();
        *index = RecordIndex::default();
        for record in loaded {
            index.insert(record);
        }
        Ok(count)
    }

    async fn write_record(&self, record: &AlarmRecord) -> Result<PathBuf> {
        let dir = self.date_dir(record.trigger_time);
        tokio::fs::create_dir_all(&dir).await?;

        let path = self.record_path(record);
        let tmp = path.with_extension("json.tmp");
        let mut stored = record.clone();
        stored.storage_path = Some(path.display().to_string());
        let bytes = serde_json::to_vec_pretty(&stored)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(path)
    }

    async fn remove_empty_date_dirs(&self) -> Result<usize> {
        let mut removed = 0;
        let mut days = tokio::fs::read_dir(&self.base_path).await?;
        while let Some(day) = days.next_entry().await? {
            if !day.file_type().await?.is_dir() {
                continue;
            }
            let mut files = tokio::fs::read_dir(day.path()).await?;
            if files.next_entry().await?.is_none() {
                tokio::fs::remove_dir(day.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

async fn load_record(path: &Path) -> Result<AlarmRecord> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn remove_file_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(AlarmError::Io(e)),
    }
}

#[async_trait]
impl RecordStorage for JsonFileStorage {
    async fn save(&self, records: &[AlarmRecord]) -> Result<()> {
        for record in records {
            let path = self.write_record(record).await?;
            let mut stored = record.clone();
            stored.storage_path = Some(path.display().to_string());
            self.index.write().insert(stored);
        }
        debug!("Saved {} record(s)", records.len());
        Ok(())
    }

    async fn get(&self, record_id: &str) -> Result<Option<AlarmRecord>> {
        Ok(self.index.read().records.get(record_id).cloned())
    }

    async fn query(&self, query: &RecordQuery) -> Result<QueryResult> {
        let matched: Vec<AlarmRecord> = {
            let index = self.index.read();
            index
                .candidates(query)
                .into_iter()
                .filter(|r| query.matches(r))
                .cloned()
                .collect()
        };
        Ok(query.paginate(matched))
    }

    async fn delete(&self, record_id: &str) -> Result<bool> {
        let removed = self.index.write().remove(record_id);
        let Some(record) = removed else {
            return Ok(false);
        };
        remove_file_if_present(&self.record_path(&record)).await?;
        Ok(true)
    }

    async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let expired: Vec<AlarmRecord> = {
            let mut index = self.index.write();
            let ids: Vec<String> = index
                .by_time
                .iter()
                .filter(|(t, _)| *t < cutoff)
                .map(|(_, id)| id.clone())
                .collect();
            ids.iter().filter_map(|id| index.remove(id)).collect()
        };

        for record in &expired {
            remove_file_if_present(&self.record_path(record)).await?;
        }
        let dirs = self.remove_empty_date_dirs().await?;
        if !expired.is_empty() {
            info!(
                "Record cleanup: {} record(s), {} empty day dir(s) removed",
                expired.len(),
                dirs
            );
        }
        Ok(expired.len())
    }

    async fn stats(&self) -> Result<RecordStats> {
        let index = self.index.read();
        let mut stats = RecordStats::default();
        for record in index.records.values() {
            stats.add(record);
        }
        Ok(stats)
    }
}
