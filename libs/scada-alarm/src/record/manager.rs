//! Record Manager
//!
//! Trigger/recover/shielded events are appended to a ring-buffer cache and
//! queued for a background batch writer (flush on batch size or timeout).
//! A second task deletes records past the retention window. Failed batches
//! are kept and retried on the next flush.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use scada_model::{AlarmLevel, AlarmState};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::export;
use super::storage::RecordStorage;
use super::types::{
    AlarmRecord, ExportFormat, ExportOptions, QueryResult, RecordEventType, RecordQuery, RecordStats,
};
use crate::alarm::ActiveAlarm;
use crate::condition::{Condition, Threshold};
use crate::error::{AlarmError, Result};
use crate::rule::AlarmRule;

/// Record manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordConfig {
    /// JSON file storage root (default: ./data/records/alarm)
    pub base_path: PathBuf,
    /// Recent records kept in memory (default: 1000)
    pub cache_size: usize,
    /// Records per storage write (default: 10)
    pub batch_size: usize,
    /// Max wait before a partial batch is written (default: 5000ms)
    pub batch_timeout_ms: u64,
    /// Pending write queue capacity (default: 1000)
    pub queue_size: usize,
    pub export_dir: PathBuf,
    /// Retention in days (default: 30)
    pub max_days: u32,
    pub cleanup_interval_secs: u64,
    /// Re-trigger suppression window per rule (default: 1000ms)
    pub dedup_window_ms: u64,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./data/records/alarm"),
            cache_size: 1000,
            batch_size: 10,
            batch_timeout_ms: 5000,
            queue_size: 1000,
            export_dir: PathBuf::from("./data/exports"),
            max_days: 30,
            cleanup_interval_secs: 3600,
            dedup_window_ms: 1000,
        }
    }
}

impl RecordConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms.max(1))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }
}

/// Written export file
#[derive(Debug, Clone, Serialize)]
pub struct ExportResult {
    pub path: PathBuf,
    pub count: usize,
    pub format: ExportFormat,
}

pub struct RecordManager {
    config: RecordConfig,
    storage: Arc<dyn RecordStorage>,
    cache: Mutex<VecDeque<AlarmRecord>>,
    queue_tx: mpsc::Sender<AlarmRecord>,
    queue_rx: Mutex<Option<mpsc::Receiver<AlarmRecord>>>,
    retry: Arc<Mutex<Vec<AlarmRecord>>>,
    last_trigger: Mutex<FxHashMap<String, Instant>>,
    counter: AtomicU64,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RecordManager {
    pub fn new(config: RecordConfig, storage: Arc<dyn RecordStorage>) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_size.max(1));
        Self {
            cache: Mutex::new(VecDeque::with_capacity(config.cache_size)),
            config,
            storage,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            retry: Arc::new(Mutex::new(Vec::new())),
            last_trigger: Mutex::new(FxHashMap::default()),
            counter: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &RecordConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn RecordStorage> {
        &self.storage
    }

    // ========== Lifecycle ==========

    /// Spawn the batch writer and retention cleanup tasks
    pub fn start(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AlarmError::NotRunning);
        }
        let Some(rx) = self.queue_rx.lock().take() else {
            return Err(AlarmError::AlreadyRunning);
        };

        let writer = tokio::spawn(batch_writer(
            rx,
            Arc::clone(&self.storage),
            Arc::clone(&self.retry),
            self.config.clone(),
            self.cancel.clone(),
        ));
        let cleanup = tokio::spawn(retention_cleanup(
            Arc::clone(&self.storage),
            self.config.max_days,
            self.config.cleanup_interval(),
            self.cancel.clone(),
        ));
        self.tasks.lock().extend([writer, cleanup]);
        info!(
            "Record manager started: batch {} / {:?}, retention {} days",
            self.config.batch_size,
            self.config.batch_timeout(),
            self.config.max_days
        );
        Ok(())
    }

    /// Flush pending records and stop background tasks
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Record task ended abnormally: {}", e);
            }
        }
        info!("Record manager stopped");
    }

    // ========== Recording ==========

    /// Record a trigger; `None` when suppressed by the dedup window
    pub async fn record_trigger(&self, rule: &AlarmRule, alarm: &ActiveAlarm) -> Result<Option<AlarmRecord>> {
        if self.is_duplicate_trigger(&rule.id) {
            debug!("Trigger record for {} deduplicated", rule.id);
            return Ok(None);
        }

        let mut record = self.base_record(rule, RecordEventType::Trigger, AlarmState::Active);
        record.trigger_time = alarm.trigger_time;
        record.message = alarm.message.clone();
        record.trigger_value = alarm.trigger_value.clone();
        self.submit(record.clone()).await;
        Ok(Some(record))
    }

    /// Record a recovery, matched against the latest trigger for the rule
    pub async fn record_recover(&self, rule: &AlarmRule, alarm: Option<&ActiveAlarm>) -> Result<AlarmRecord> {
        let trigger = self.latest_trigger(&rule.id).await?;
        let now = Utc::now();

        let mut record = self.base_record(rule, RecordEventType::Recover, AlarmState::Cleared);
        record.recover_time = Some(now);

        if let Some(trigger) = &trigger {
            record.level = trigger.level;
            record.category = trigger.category.clone();
            record.trigger_time = trigger.trigger_time;
            record.message = trigger.message.clone();
            record.trigger_value = trigger.trigger_value.clone();
        }
        if let Some(alarm) = alarm {
            record.trigger_time = alarm.trigger_time;
            record.ack_user = alarm.ack_user.clone();
            if record.trigger_value.is_none() {
                record.trigger_value = alarm.trigger_value.clone();
            }
            if record.message.is_empty() {
                record.message = alarm.message.clone();
            }
        }
        if record.message.is_empty() {
            record.message = rule.name.clone();
        }
        if trigger.is_some() || alarm.is_some() {
            let millis = (now - record.trigger_time).num_milliseconds().max(0);
            record.duration_secs = Some(millis as f64 / 1000.0);
        }

        self.submit(record.clone()).await;
        Ok(record)
    }

    /// Record a shielded evaluation (no state change)
    pub async fn record_shielded(&self, rule: &AlarmRule, message: &str) -> Result<AlarmRecord> {
        let mut record = self.base_record(rule, RecordEventType::Shielded, AlarmState::Inactive);
        record.message = if message.is_empty() {
            rule.name.clone()
        } else {
            message.to_string()
        };
        self.submit(record.clone()).await;
        Ok(record)
    }

    fn base_record(&self, rule: &AlarmRule, event_type: RecordEventType, state: AlarmState) -> AlarmRecord {
        let now = Utc::now();
        AlarmRecord {
            id: self.next_record_id(now),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            event_type,
            level: rule.level,
            state,
            category: rule.category.clone(),
            trigger_time: now,
            recover_time: None,
            duration_secs: None,
            message: String::new(),
            threshold: threshold_text(&rule.condition),
            trigger_value: None,
            responsible_users: rule.responsible_users.clone(),
            ack_user: None,
            cloud_reported: false,
            storage_path: None,
            created_at: now,
        }
    }

    /// `REC_{unix_nanos}_{seq:04}`
    fn next_record_id(&self, now: DateTime<Utc>) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed) % 10_000;
        format!("REC_{}_{:04}", now.timestamp_nanos_opt().unwrap_or_default(), seq)
    }

    fn is_duplicate_trigger(&self, rule_id: &str) -> bool {
        let window = self.config.dedup_window();
        let now = Instant::now();
        let mut last = self.last_trigger.lock();
        match last.get(rule_id) {
            Some(at) if now.duration_since(*at) < window => true,
            _ => {
                last.insert(rule_id.to_string(), now);
                false
            },
        }
    }

    async fn submit(&self, record: AlarmRecord) {
        {
            let mut cache = self.cache.lock();
            if self.config.cache_size > 0 {
                while cache.len() >= self.config.cache_size {
                    cache.pop_front();
                }
                cache.push_back(record.clone());
            }
        }

        let record = match self.queue_tx.try_send(record) {
            Ok(()) => return,
            Err(TrySendError::Full(record)) => {
                warn!("Record queue full, writing {} synchronously", record.id);
                record
            },
            Err(TrySendError::Closed(record)) => record,
        };

        if let Err(e) = self.storage.save(std::slice::from_ref(&record)).await {
            error!("Failed to persist record {}: {}", record.id, e);
            push_retry(&self.retry, vec![record], self.config.queue_size);
        }
    }

    async fn latest_trigger(&self, rule_id: &str) -> Result<Option<AlarmRecord>> {
        let cached = self
            .cache
            .lock()
            .iter()
            .rev()
            .find(|r| r.rule_id == rule_id && r.event_type == RecordEventType::Trigger)
            .cloned();
        if cached.is_some() {
            return Ok(cached);
        }

        let query = RecordQuery {
            event_types: vec![RecordEventType::Trigger],
            limit: 1,
            ..RecordQuery::for_rule(rule_id)
        };
        Ok(self.storage.query(&query).await?.records.into_iter().next())
    }

    // ========== Queries ==========

    pub async fn query(&self, query: &RecordQuery) -> Result<QueryResult> {
        if query.is_simple() {
            let cached: Vec<AlarmRecord> = self
                .cache
                .lock()
                .iter()
                .filter(|r| query.matches(r))
                .cloned()
                .collect();
            if !cached.is_empty() {
                return Ok(query.paginate(cached));
            }
        }
        self.storage.query(query).await
    }

    /// Most recent records, newest first
    pub fn recent(&self, limit: usize) -> Vec<AlarmRecord> {
        self.cache.lock().iter().rev().take(limit).cloned().collect()
    }

    pub async fn stats(&self) -> Result<RecordStats> {
        self.storage.stats().await
    }

    pub async fn delete(&self, record_id: &str) -> Result<bool> {
        self.cache.lock().retain(|r| r.id != record_id);
        self.storage.delete(record_id).await
    }

    pub async fn cleanup_old_records(&self, max_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(max_days));
        self.cache.lock().retain(|r| r.trigger_time >= cutoff);
        self.storage.cleanup_before(cutoff).await
    }

    // ========== Export ==========

    pub async fn export(&self, options: &ExportOptions) -> Result<ExportResult> {
        let result = self.storage.query(&options.query).await?;
        let bytes = export::render(&result.records, options.format, options.include_header)?;

        tokio::fs::create_dir_all(&self.config.export_dir).await?;
        let name = options
            .file_name
            .clone()
            .unwrap_or_else(|| format!("alarm_records_{}", Utc::now().format("%Y%m%d_%H%M%S")));
        let path = self
            .config
            .export_dir
            .join(format!("{}.{}", name, options.format.extension()));
        tokio::fs::write(&path, bytes).await?;

        info!("Exported {} record(s) to {}", result.records.len(), path.display());
        Ok(ExportResult {
            path,
            count: result.records.len(),
            format: options.format,
        })
    }

    pub async fn export_by_rule(&self, rule_id: &str, format: ExportFormat) -> Result<ExportResult> {
        self.export(&ExportOptions {
            format,
            query: RecordQuery::for_rule(rule_id).unlimited(),
            file_name: Some(format!("alarm_records_{}", rule_id)),
            ..ExportOptions::default()
        })
        .await
    }

    pub async fn export_by_level(&self, level: AlarmLevel, format: ExportFormat) -> Result<ExportResult> {
        self.export(&ExportOptions {
            format,
            query: RecordQuery {
                levels: vec![level],
                ..RecordQuery::default()
            }
            .unlimited(),
            file_name: Some(format!("alarm_records_{}", level)),
            ..ExportOptions::default()
        })
        .await
    }

    pub async fn export_by_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        format: ExportFormat,
    ) -> Result<ExportResult> {
        self.export(&ExportOptions {
            format,
            query: RecordQuery {
                start_time: Some(start),
                end_time: Some(end),
                ..RecordQuery::default()
            }
            .unlimited(),
            file_name: Some(format!(
                "alarm_records_{}_{}",
                start.format("%Y%m%d"),
                end.format("%Y%m%d")
            )),
            ..ExportOptions::default()
        })
        .await
    }
}

/// Human-readable threshold of a rule's primary condition
fn threshold_text(condition: &Condition) -> String {
    match condition {
        Condition::Single(single) => match &single.threshold {
            Some(Threshold::Static { value }) if !single.operator.is_edge() => {
                format!("{} {}", single.operator, value)
            },
            Some(Threshold::Variable { variable_id }) if !single.operator.is_edge() => {
                format!("{} var:{}", single.operator, variable_id)
            },
            _ => single.operator.to_string(),
        },
        Condition::Group(_) => condition.to_string(),
    }
}

/// Keep at most `cap` records for retry, dropping the oldest
fn push_retry(retry: &Mutex<Vec<AlarmRecord>>, records: Vec<AlarmRecord>, cap: usize) {
    let mut retry = retry.lock();
    retry.extend(records);
    if retry.len() > cap {
        let excess = retry.len() - cap;
        retry.drain(..excess);
        warn!("Record retry buffer full, {} oldest record(s) discarded", excess);
    }
}

async fn flush(
    storage: &Arc<dyn RecordStorage>,
    retry: &Arc<Mutex<Vec<AlarmRecord>>>,
    batch: &mut Vec<AlarmRecord>,
    cap: usize,
) {
    let mut pending: Vec<AlarmRecord> = std::mem::take(&mut *retry.lock());
    pending.append(batch);
    if pending.is_empty() {
        return;
    }
    match storage.save(&pending).await {
        Ok(()) => debug!("Flushed {} record(s)", pending.len()),
        Err(e) => {
            error!("Record batch write failed ({} records): {}", pending.len(), e);
            push_retry(retry, pending, cap);
        },
    }
}

async fn batch_writer(
    mut rx: mpsc::Receiver<AlarmRecord>,
    storage: Arc<dyn RecordStorage>,
    retry: Arc<Mutex<Vec<AlarmRecord>>>,
    config: RecordConfig,
    cancel: CancellationToken,
) {
    let batch_size = config.batch_size.max(1);
    let mut batch: Vec<AlarmRecord> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(config.batch_timeout());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Some(record) => {
                    batch.push(record);
                    if batch.len() >= batch_size {
                        flush(&storage, &retry, &mut batch, config.queue_size).await;
                    }
                },
                None => break,
            },
            _ = ticker.tick() => {
                flush(&storage, &retry, &mut batch, config.queue_size).await;
            },
        }
    }

    rx.close();
    while let Ok(record) = rx.try_recv() {
        batch.push(record);
    }
    flush(&storage, &retry, &mut batch, config.queue_size).await;
    debug!("Record batch writer exited");
}

async fn retention_cleanup(
    storage: Arc<dyn RecordStorage>,
    max_days: u32,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let cutoff = Utc::now() - ChronoDuration::days(i64::from(max_days));
                match storage.cleanup_before(cutoff).await {
                    Ok(0) => {},
                    Ok(n) => info!("Retention cleanup removed {} record(s)", n),
                    Err(e) => error!("Retention cleanup failed: {}", e),
                }
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::condition::{Operator, SingleCondition};
    use crate::record::storage::JsonFileStorage;
    use scada_model::Value;
    use tempfile::TempDir;

    fn rule(id: &str) -> AlarmRule {
        AlarmRule::new(id, format!("{} name", id), SingleCondition::new(1, Operator::Gte, 80.0).into())
            .with_level(AlarmLevel::High)
            .with_category("power")
    }

    async fn manager(dir: &TempDir, config: RecordConfig) -> RecordManager {
        let storage = JsonFileStorage::open(dir.path().join("records")).await.unwrap();
        RecordManager::new(
            RecordConfig {
                export_dir: dir.path().join("exports"),
                ..config
            },
            Arc::new(storage),
        )
    }

    #[test]
    fn test_threshold_text() {
        assert_eq!(threshold_text(&rule("R1").condition), ">= 80");
        let edge: Condition = SingleCondition::edge(1, Operator::RisingEdge).into();
        assert_eq!(threshold_text(&edge), "rising_edge");
    }

    #[tokio::test]
    async fn test_record_id_format() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, RecordConfig::default()).await;
        let id = m.next_record_id(Utc::now());
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts[0], "REC");
        assert_eq!(parts[2], "0000");
        assert_eq!(m.next_record_id(Utc::now()).rsplit('_').next(), Some("0001"));
    }

    #[tokio::test]
    async fn test_trigger_dedup_window() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, RecordConfig::default()).await;
        let r = rule("R1");
        let alarm = ActiveAlarm::new(&r, Some(Value::Float(85.0)), "hot".to_string());

        assert!(m.record_trigger(&r, &alarm).await.unwrap().is_some());
        assert!(m.record_trigger(&r, &alarm).await.unwrap().is_none());
        assert!(m.record_trigger(&rule("R2"), &alarm).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_recover_links_trigger() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, RecordConfig::default()).await;
        let r = rule("R1");
        let mut alarm = ActiveAlarm::new(&r, Some(Value::Float(85.0)), "hot".to_string());
        alarm.ack_user = Some("alice".to_string());
        m.record_trigger(&r, &alarm).await.unwrap();

        let recover = m.record_recover(&r, Some(&alarm)).await.unwrap();
        assert_eq!(recover.event_type, RecordEventType::Recover);
        assert_eq!(recover.trigger_time, alarm.trigger_time);
        assert_eq!(recover.message, "hot");
        assert_eq!(recover.ack_user.as_deref(), Some("alice"));
        assert_eq!(recover.trigger_value, Some(Value::Float(85.0)));
        assert!(recover.duration_secs.unwrap() >= 0.0);
        assert!(recover.recover_time.is_some());
    }

    #[tokio::test]
    async fn test_recover_without_trigger_uses_rule() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, RecordConfig::default()).await;
        let recover = m.record_recover(&rule("R9"), None).await.unwrap();
        assert_eq!(recover.message, "R9 name");
        assert!(recover.duration_secs.is_none());
    }

    #[tokio::test]
    async fn test_simple_query_served_from_cache() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, RecordConfig::default()).await;
        // Not started: nothing reaches storage yet
        m.record_shielded(&rule("R1"), "").await.unwrap();

        let cached = m.query(&RecordQuery::for_rule("R1")).await.unwrap();
        assert_eq!(cached.total, 1);
        assert_eq!(cached.records[0].event_type, RecordEventType::Shielded);

        let complex = RecordQuery {
            levels: vec![AlarmLevel::High],
            ..RecordQuery::default()
        };
        assert_eq!(m.query(&complex).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_queue_full_writes_synchronously() {
        let dir = TempDir::new().unwrap();
        let m = manager(
            &dir,
            RecordConfig {
                queue_size: 1,
                ..RecordConfig::default()
            },
        )
        .await;
        m.record_shielded(&rule("R1"), "a").await.unwrap();
        m.record_shielded(&rule("R1"), "b").await.unwrap();

        // Second record bypassed the full queue
        let stored = m.storage().query(&RecordQuery::default()).await.unwrap();
        assert_eq!(stored.total, 1);
        assert_eq!(stored.records[0].message, "b");
    }

    #[tokio::test]
    async fn test_stop_flushes_pending_batch() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, RecordConfig::default()).await;
        m.start().unwrap();
        for i in 0..3 {
            m.record_shielded(&rule(&format!("R{}", i)), "").await.unwrap();
        }
        m.stop().await;

        let stats = m.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.shielded_count, 3);
    }

    #[tokio::test]
    async fn test_cache_is_bounded() {
        let dir = TempDir::new().unwrap();
        let m = manager(
            &dir,
            RecordConfig {
                cache_size: 2,
                ..RecordConfig::default()
            },
        )
        .await;
        for msg in ["a", "b", "c"] {
            m.record_shielded(&rule("R1"), msg).await.unwrap();
        }
        let recent: Vec<String> = m.recent(10).into_iter().map(|r| r.message).collect();
        assert_eq!(recent, vec!["c", "b"]);
    }
}
