//! Sharded in-memory variable store
//!
//! 64 shards selected by `id & 63`, each with its own lock over the numeric
//! ID map, the string-ID map and the device index. String IDs are placed by
//! FNV-1a hash, so a variable's string binding may live in another shard than
//! the variable itself; the two locks are never held together.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use scada_model::{fnv1a_64, IdGenerator, Variable, VariableUpdate};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::error::{Result, RtdbError};
use crate::traits::{StorageStats, UpdateCallback, VariableStorage};

/// Number of shards (power of two)
pub const SHARD_COUNT: usize = 64;
const SHARD_MASK: u64 = (SHARD_COUNT as u64) - 1;

/// Batches at or above this size are fanned out across shard tasks
const PARALLEL_BATCH_THRESHOLD: usize = 256;

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Concurrent shard reads admitted across all batch reads (default: 100)
    pub batch_read_concurrency: usize,
    pub dispatcher: DispatcherConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            batch_read_concurrency: 100,
            dispatcher: DispatcherConfig::default(),
        }
    }
}

#[derive(Default)]
struct ShardMaps {
    by_id: FxHashMap<u64, Variable>,
    by_string: FxHashMap<String, u64>,
    by_device: FxHashMap<String, FxHashSet<u64>>,
}

struct Shard {
    maps: RwLock<ShardMaps>,
}

#[inline]
fn shard_index(id: u64) -> usize {
    (id & SHARD_MASK) as usize
}

#[inline]
fn string_shard_index(string_id: &str) -> usize {
    shard_index(fnv1a_64(string_id))
}

enum WriteOutcome {
    Updated,
    Inserted,
}

struct StoreInner {
    shards: Vec<Shard>,
    dispatcher: Dispatcher,
    id_generator: IdGenerator,
    batch_permits: Arc<Semaphore>,
    read_count: AtomicU64,
    write_count: AtomicU64,
    start_time: DateTime<Utc>,
}

impl StoreInner {
    fn shard(&self, id: u64) -> &Shard {
        &self.shards[shard_index(id)]
    }

    fn lookup_string(&self, string_id: &str) -> Option<u64> {
        self.shards[string_shard_index(string_id)]
            .maps
            .read()
            .by_string
            .get(string_id)
            .copied()
    }

    fn bind_string(&self, string_id: &str, id: u64) -> Result<()> {
        if string_id.is_empty() {
            return Ok(());
        }
        let mut maps = self.shards[string_shard_index(string_id)].maps.write();
        match maps.by_string.get(string_id) {
            Some(existing) if *existing != id => Err(RtdbError::DuplicateStringId {
                string_id: string_id.to_string(),
                existing: *existing,
            }),
            Some(_) => Ok(()),
            None => {
                maps.by_string.insert(string_id.to_string(), id);
                Ok(())
            },
        }
    }

    fn unbind_string(&self, string_id: &str, id: u64) {
        if string_id.is_empty() {
            return;
        }
        let mut maps = self.shards[string_shard_index(string_id)].maps.write();
        if maps.by_string.get(string_id) == Some(&id) {
            maps.by_string.remove(string_id);
        }
    }

    /// Update in place when present, otherwise bind the string ID and insert
    fn upsert(&self, variable: Variable) -> Result<(WriteOutcome, Variable)> {
        if variable.id == 0 {
            return Err(RtdbError::InvalidVariable("variable ID 0 is reserved".to_string()));
        }

        {
            let mut maps = self.shard(variable.id).maps.write();
            if let Some(existing) = maps.by_id.get_mut(&variable.id) {
                existing.set_value(variable.value, variable.quality, variable.timestamp);
                return Ok((WriteOutcome::Updated, existing.clone()));
            }
        }

        self.bind_string(&variable.string_id, variable.id)?;

        let mut maps = self.shard(variable.id).maps.write();
        if let Some(existing) = maps.by_id.get_mut(&variable.id) {
            // Lost an insert race: fall back to the in-place update
            existing.set_value(variable.value, variable.quality, variable.timestamp);
            return Ok((WriteOutcome::Updated, existing.clone()));
        }
        if !variable.device_id.is_empty() {
            maps.by_device
                .entry(variable.device_id.clone())
                .or_default()
                .insert(variable.id);
        }
        maps.by_id.insert(variable.id, variable.clone());
        self.id_generator.mark_used(variable.id);
        Ok((WriteOutcome::Inserted, variable))
    }

    fn write_and_publish(&self, variable: Variable) -> Result<()> {
        let (outcome, stored) = self.upsert(variable)?;
        self.write_count.fetch_add(1, Ordering::Relaxed);
        if matches!(outcome, WriteOutcome::Inserted) {
            debug!("Variable {} ({}) inserted", stored.id, stored.string_id);
        }
        self.publish(&stored);
        Ok(())
    }

    fn publish(&self, stored: &Variable) {
        let update: VariableUpdate = stored.to_update();
        self.dispatcher
            .publish(stored.id, &stored.string_id, &stored.device_id, &update);
    }

    fn read_shard(&self, shard: usize, ids: &[(usize, u64)]) -> Vec<(usize, Variable)> {
        let maps = self.shards[shard].maps.read();
        ids.iter()
            .filter_map(|(pos, id)| maps.by_id.get(id).map(|v| (*pos, v.clone())))
            .collect()
    }
}

/// Sharded in-memory implementation of [`VariableStorage`]
///
/// Cloning is cheap and shares the same store.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<StoreInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_config(StorageConfig::default())
    }

    pub fn with_config(config: StorageConfig) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Shard {
                maps: RwLock::new(ShardMaps::default()),
            })
            .collect();

        Self {
            inner: Arc::new(StoreInner {
                shards,
                dispatcher: Dispatcher::new(config.dispatcher),
                id_generator: IdGenerator::new(),
                batch_permits: Arc::new(Semaphore::new(config.batch_read_concurrency.max(1))),
                read_count: AtomicU64::new(0),
                write_count: AtomicU64::new(0),
                start_time: Utc::now(),
            }),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Variable count per shard (for balance checks)
    pub fn shard_sizes(&self) -> Vec<usize> {
        self.inner
            .shards
            .iter()
            .map(|s| s.maps.read().by_id.len())
            .collect()
    }

    fn variable_count(&self) -> usize {
        self.shard_sizes().iter().sum()
    }

    fn group_by_shard(ids: &[u64]) -> FxHashMap<usize, Vec<(usize, u64)>> {
        let mut groups: FxHashMap<usize, Vec<(usize, u64)>> = FxHashMap::default();
        for (pos, id) in ids.iter().enumerate() {
            groups.entry(shard_index(*id)).or_default().push((pos, *id));
        }
        groups
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VariableStorage for MemoryStorage {
    async fn start(&self) -> Result<()> {
        self.inner.dispatcher.start()?;
        info!("Memory storage started with {} shards", SHARD_COUNT);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.inner.dispatcher.stop().await;
        info!("Memory storage stopped");
        Ok(())
    }

    async fn read(&self, id: u64) -> Result<Variable> {
        self.inner.read_count.fetch_add(1, Ordering::Relaxed);
        self.inner
            .shard(id)
            .maps
            .read()
            .by_id
            .get(&id)
            .cloned()
            .ok_or(RtdbError::NotFound(id))
    }

    async fn read_batch(&self, ids: &[u64]) -> Result<Vec<Variable>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.inner
            .read_count
            .fetch_add(ids.len() as u64, Ordering::Relaxed);

        let groups = Self::group_by_shard(ids);
        let mut found: Vec<(usize, Variable)> = Vec::with_capacity(ids.len());

        if ids.len() < PARALLEL_BATCH_THRESHOLD {
            let _permit = self
                .inner
                .batch_permits
                .acquire()
                .await
                .map_err(|_| RtdbError::Stopped)?;
            for (shard, group) in &groups {
                found.extend(self.inner.read_shard(*shard, group));
            }
        } else {
            let tasks = groups.into_iter().map(|(shard, group)| {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    let _permit = inner.batch_permits.acquire().await.ok()?;
                    Some(inner.read_shard(shard, &group))
                })
            });
            for result in join_all(tasks).await {
                match result {
                    Ok(Some(part)) => found.extend(part),
                    Ok(None) => return Err(RtdbError::Stopped),
                    Err(e) => return Err(RtdbError::Other(anyhow::anyhow!("shard read task failed: {}", e))),
                }
            }
        }

        found.sort_unstable_by_key(|(pos, _)| *pos);
        Ok(found.into_iter().map(|(_, v)| v).collect())
    }

    async fn read_by_string_id(&self, string_id: &str) -> Result<Variable> {
        let id = self
            .inner
            .lookup_string(string_id)
            .ok_or_else(|| RtdbError::NotFoundByName(string_id.to_string()))?;
        self.read(id).await
    }

    async fn write(&self, variable: Variable) -> Result<()> {
        self.inner.write_and_publish(variable)
    }

    async fn write_batch(&self, variables: Vec<Variable>) -> Result<()> {
        if variables.is_empty() {
            return Ok(());
        }

        let mut groups: FxHashMap<usize, Vec<Variable>> = FxHashMap::default();
        for variable in variables {
            groups.entry(shard_index(variable.id)).or_default().push(variable);
        }

        let mut errors: Vec<RtdbError> = Vec::new();
        if groups.len() == 1 || groups.values().map(Vec::len).sum::<usize>() < PARALLEL_BATCH_THRESHOLD {
            for variable in groups.into_values().flatten() {
                if let Err(e) = self.inner.write_and_publish(variable) {
                    errors.push(e);
                }
            }
        } else {
            let tasks = groups.into_values().map(|group| {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    group
                        .into_iter()
                        .filter_map(|v| inner.write_and_publish(v).err())
                        .collect::<Vec<_>>()
                })
            });
            for result in join_all(tasks).await {
                match result {
                    Ok(errs) => errors.extend(errs),
                    Err(e) => errors.push(RtdbError::Other(anyhow::anyhow!("shard write task failed: {}", e))),
                }
            }
        }

        match errors.first() {
            None => Ok(()),
            Some(first) => {
                warn!("Batch write: {} variable(s) rejected", errors.len());
                Err(RtdbError::Batch {
                    failed: errors.len(),
                    first_error: first.to_string(),
                })
            },
        }
    }

    async fn create_variable(&self, mut variable: Variable) -> Result<u64> {
        let allocated = variable.id == 0;
        if allocated {
            variable.id = self.inner.id_generator.next_custom_id()?;
        } else if self.inner.shard(variable.id).maps.read().by_id.contains_key(&variable.id) {
            return Err(RtdbError::AlreadyExists(variable.id));
        }

        let id = variable.id;
        if let Err(e) = self.inner.bind_string(&variable.string_id, id) {
            if allocated {
                self.inner.id_generator.release(id);
            }
            return Err(e);
        }
        {
            let mut maps = self.inner.shard(id).maps.write();
            if maps.by_id.contains_key(&id) {
                drop(maps);
                self.inner.unbind_string(&variable.string_id, id);
                return Err(RtdbError::AlreadyExists(id));
            }
            if !variable.device_id.is_empty() {
                maps.by_device
                    .entry(variable.device_id.clone())
                    .or_default()
                    .insert(id);
            }
            maps.by_id.insert(id, variable);
        }
        self.inner.id_generator.mark_used(id);
        debug!("Variable {} created", id);
        Ok(id)
    }

    async fn delete_variable(&self, id: u64) -> Result<()> {
        let removed = {
            let mut maps = self.inner.shard(id).maps.write();
            let removed = maps.by_id.remove(&id).ok_or(RtdbError::NotFound(id))?;
            if let Some(ids) = maps.by_device.get_mut(&removed.device_id) {
                ids.remove(&id);
                if ids.is_empty() {
                    maps.by_device.remove(&removed.device_id);
                }
            }
            removed
        };
        self.inner.unbind_string(&removed.string_id, id);
        self.inner.id_generator.release(id);
        debug!("Variable {} deleted", id);
        Ok(())
    }

    async fn list_variables(&self) -> Result<Vec<Variable>> {
        let mut all = Vec::new();
        for shard in &self.inner.shards {
            all.extend(shard.maps.read().by_id.values().cloned());
        }
        all.sort_unstable_by_key(|v| v.id);
        Ok(all)
    }

    async fn list_variables_by_device(&self, device_id: &str) -> Result<Vec<Variable>> {
        let mut all = Vec::new();
        for shard in &self.inner.shards {
            let maps = shard.maps.read();
            if let Some(ids) = maps.by_device.get(device_id) {
                all.extend(ids.iter().filter_map(|id| maps.by_id.get(id).cloned()));
            }
        }
        all.sort_unstable_by_key(|v| v.id);
        Ok(all)
    }

    fn subscribe(
        &self,
        subscriber_id: &str,
        variable_ids: &[u64],
        callback: UpdateCallback,
    ) -> Result<()> {
        self.inner
            .dispatcher
            .subscribe(subscriber_id, variable_ids, callback);
        Ok(())
    }

    fn subscribe_by_device(
        &self,
        subscriber_id: &str,
        device_id: &str,
        callback: UpdateCallback,
    ) -> Result<()> {
        self.inner
            .dispatcher
            .subscribe_by_device(subscriber_id, device_id, callback);
        Ok(())
    }

    fn subscribe_by_pattern(
        &self,
        subscriber_id: &str,
        pattern: &str,
        callback: UpdateCallback,
    ) -> Result<()> {
        self.inner
            .dispatcher
            .subscribe_by_pattern(subscriber_id, pattern, callback)
    }

    fn unsubscribe(&self, subscriber_id: &str, variable_ids: &[u64]) -> Result<()> {
        self.inner.dispatcher.unsubscribe(subscriber_id, variable_ids);
        Ok(())
    }

    fn unsubscribe_all(&self, subscriber_id: &str) -> Result<()> {
        self.inner.dispatcher.unsubscribe_all(subscriber_id);
        Ok(())
    }

    fn stats(&self) -> StorageStats {
        let dispatcher = self.inner.dispatcher.stats();
        StorageStats {
            variable_count: self.variable_count(),
            subscriber_count: self.inner.dispatcher.subscriber_count(),
            subscription_count: self.inner.dispatcher.subscription_count(),
            read_count: self.inner.read_count.load(Ordering::Relaxed),
            write_count: self.inner.write_count.load(Ordering::Relaxed),
            notifications_delivered: dispatcher.delivered.load(Ordering::Relaxed),
            notifications_dropped: dispatcher.dropped.load(Ordering::Relaxed),
            callback_timeouts: dispatcher.timeouts.load(Ordering::Relaxed),
            callback_panics: dispatcher.panics.load(Ordering::Relaxed),
            start_time: self.inner.start_time,
        }
    }
}
