//! Subscription Dispatcher
//!
//! Subscriptions are indexed four ways: exact variable ID, device ID,
//! string-ID prefix and `*` wildcard (plus exact string ID for patterns
//! without either marker). `publish` matches an update against every table
//! and queues one notification per matching subscription.
//!
//! Delivery is best-effort: a bounded queue is drained by a fixed worker pool;
//! a full queue drops the notification with a warning, and each callback runs
//! on the blocking pool behind a panic barrier and a timeout.

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use scada_model::VariableUpdate;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, RtdbError};
use crate::traits::UpdateCallback;

/// Separator that turns a pattern into a prefix subscription
pub const PREFIX_SEPARATOR: char = '-';

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Bounded notification queue capacity (default: 10000)
    pub queue_size: usize,
    /// Notification worker count (default: 100)
    pub workers: usize,
    /// Callback wait before it is abandoned (default: 100ms)
    pub callback_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_size: 10_000,
            workers: 100,
            callback_timeout_ms: 100,
        }
    }
}

impl DispatcherConfig {
    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }
}

/// How a subscription selects variables
#[derive(Debug, Clone)]
pub enum SubscriptionMode {
    Exact(Vec<u64>),
    Device(String),
    Prefix(String),
    Wildcard(Regex),
    StringId(String),
}

pub struct Subscription {
    /// `{subscriber}-exact-{ids:?}`, `{subscriber}-device-{device}` or `{subscriber}-pattern-{pattern}`
    pub key: String,
    pub subscriber_id: String,
    pub mode: SubscriptionMode,
    callback: UpdateCallback,
}

impl Subscription {
    fn belongs_to(&self, subscriber_id: &str) -> bool {
        ["exact", "device", "pattern"]
            .iter()
            .any(|kind| self.key.starts_with(&format!("{}-{}-", subscriber_id, kind)))
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("mode", &self.mode)
            .finish()
    }
}

#[derive(Default)]
struct SubscriptionTables {
    exact: FxHashMap<u64, Vec<Arc<Subscription>>>,
    device: FxHashMap<String, Vec<Arc<Subscription>>>,
    string_id: FxHashMap<String, Vec<Arc<Subscription>>>,
    prefix: Vec<Arc<Subscription>>,
    wildcard: Vec<Arc<Subscription>>,
}

impl SubscriptionTables {
    fn all(&self) -> impl Iterator<Item = &Arc<Subscription>> {
        self.exact
            .values()
            .chain(self.device.values())
            .chain(self.string_id.values())
            .flatten()
            .chain(self.prefix.iter())
            .chain(self.wildcard.iter())
    }

    fn retain(&mut self, keep: impl Fn(&Subscription) -> bool) {
        for subs in self.exact.values_mut() {
            subs.retain(|s| keep(s));
        }
        for subs in self.device.values_mut() {
            subs.retain(|s| keep(s));
        }
        for subs in self.string_id.values_mut() {
            subs.retain(|s| keep(s));
        }
        self.prefix.retain(|s| keep(s));
        self.wildcard.retain(|s| keep(s));

        self.exact.retain(|_, subs| !subs.is_empty());
        self.device.retain(|_, subs| !subs.is_empty());
        self.string_id.retain(|_, subs| !subs.is_empty());
    }
}

struct NotifyTask {
    subscription: Arc<Subscription>,
    update: VariableUpdate,
}

/// Delivery counters
#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub published: AtomicU64,
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
    pub timeouts: AtomicU64,
    pub panics: AtomicU64,
}

/// Publish/subscribe dispatcher with a bounded worker pool
pub struct Dispatcher {
    tables: RwLock<SubscriptionTables>,
    queue_tx: mpsc::Sender<NotifyTask>,
    queue_rx: Mutex<Option<mpsc::Receiver<NotifyTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    config: DispatcherConfig,
    stats: Arc<DispatcherStats>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_size.max(1));
        Self {
            tables: RwLock::new(SubscriptionTables::default()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            workers: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            config,
            stats: Arc::new(DispatcherStats::default()),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }

    // ========== Worker Pool ==========

    /// Spawn the notification workers (must run inside a tokio runtime)
    pub fn start(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RtdbError::Stopped);
        }
        let Some(rx) = self.queue_rx.lock().take() else {
            warn!("Dispatcher already running");
            return Ok(());
        };

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let timeout = self.config.callback_timeout();
        let mut workers = self.workers.lock();
        for worker_id in 0..self.config.workers.max(1) {
            let rx = Arc::clone(&rx);
            let cancel = self.cancel.clone();
            let stats = Arc::clone(&self.stats);
            workers.push(tokio::spawn(async move {
                notify_worker(worker_id, rx, cancel, stats, timeout).await;
            }));
        }
        info!(
            "Dispatcher started: {} workers, queue {}",
            self.config.workers, self.config.queue_size
        );
        Ok(())
    }

    /// Cancel the workers and wait for them to exit
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Notification worker ended abnormally: {}", e);
            }
        }
        info!("Dispatcher stopped");
    }

    // ========== Registration ==========

    pub fn subscribe(&self, subscriber_id: &str, variable_ids: &[u64], callback: UpdateCallback) {
        let subscription = Arc::new(Subscription {
            key: format!("{}-exact-{:?}", subscriber_id, variable_ids),
            subscriber_id: subscriber_id.to_string(),
            mode: SubscriptionMode::Exact(variable_ids.to_vec()),
            callback,
        });

        let mut tables = self.tables.write();
        for id in variable_ids {
            tables
                .exact
                .entry(*id)
                .or_default()
                .push(Arc::clone(&subscription));
        }
        debug!("Subscribed {} to {} variable(s)", subscriber_id, variable_ids.len());
    }

    pub fn subscribe_by_device(&self, subscriber_id: &str, device_id: &str, callback: UpdateCallback) {
        let subscription = Arc::new(Subscription {
            key: format!("{}-device-{}", subscriber_id, device_id),
            subscriber_id: subscriber_id.to_string(),
            mode: SubscriptionMode::Device(device_id.to_string()),
            callback,
        });
        self.tables
            .write()
            .device
            .entry(device_id.to_string())
            .or_default()
            .push(subscription);
    }

    pub fn subscribe_by_pattern(
        &self,
        subscriber_id: &str,
        pattern: &str,
        callback: UpdateCallback,
    ) -> Result<()> {
        let mode = if pattern.contains('*') {
            SubscriptionMode::Wildcard(compile_wildcard(pattern)?)
        } else if pattern.ends_with(PREFIX_SEPARATOR) {
            SubscriptionMode::Prefix(pattern.to_string())
        } else {
            SubscriptionMode::StringId(pattern.to_string())
        };

        let subscription = Arc::new(Subscription {
            key: format!("{}-pattern-{}", subscriber_id, pattern),
            subscriber_id: subscriber_id.to_string(),
            mode,
            callback,
        });

        let mut tables = self.tables.write();
        match &subscription.mode {
            SubscriptionMode::Wildcard(_) => tables.wildcard.push(subscription),
            SubscriptionMode::Prefix(_) => tables.prefix.push(subscription),
            _ => tables
                .string_id
                .entry(pattern.to_string())
                .or_default()
                .push(subscription),
        }
        Ok(())
    }

    /// Remove the subscriber's exact registrations for the given IDs
    pub fn unsubscribe(&self, subscriber_id: &str, variable_ids: &[u64]) {
        let mut tables = self.tables.write();
        for id in variable_ids {
            if let Some(subs) = tables.exact.get_mut(id) {
                subs.retain(|s| !s.belongs_to(subscriber_id));
                if subs.is_empty() {
                    tables.exact.remove(id);
                }
            }
        }
    }

    /// Remove every registration whose key carries the subscriber prefix
    pub fn unsubscribe_all(&self, subscriber_id: &str) {
        self.tables.write().retain(|s| !s.belongs_to(subscriber_id));
        debug!("Unsubscribed all for {}", subscriber_id);
    }

    // ========== Publishing ==========

    /// Queue one notification per matching subscription without blocking
    pub fn publish(&self, variable_id: u64, string_id: &str, device_id: &str, update: &VariableUpdate) {
        self.stats.published.fetch_add(1, Ordering::Relaxed);

        let matches = self.matching(variable_id, string_id, device_id);
        for subscription in matches {
            let task = NotifyTask {
                subscription,
                update: update.clone(),
            };
            match self.queue_tx.try_send(task) {
                Ok(()) => {},
                Err(TrySendError::Full(task)) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Notification queue full, dropping update for variable {} ({})",
                        variable_id, task.subscription.key
                    );
                },
                Err(TrySendError::Closed(_)) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("Dispatcher closed, update for {} discarded", variable_id);
                },
            }
        }
    }

    fn matching(&self, variable_id: u64, string_id: &str, device_id: &str) -> Vec<Arc<Subscription>> {
        let tables = self.tables.read();
        let mut matches = Vec::new();

        if let Some(subs) = tables.exact.get(&variable_id) {
            matches.extend(subs.iter().cloned());
        }
        if !device_id.is_empty() {
            if let Some(subs) = tables.device.get(device_id) {
                matches.extend(subs.iter().cloned());
            }
        }
        if !string_id.is_empty() {
            if let Some(subs) = tables.string_id.get(string_id) {
                matches.extend(subs.iter().cloned());
            }
            for sub in &tables.prefix {
                if let SubscriptionMode::Prefix(prefix) = &sub.mode {
                    if string_id.starts_with(prefix.as_str()) {
                        matches.push(Arc::clone(sub));
                    }
                }
            }
            for sub in &tables.wildcard {
                if let SubscriptionMode::Wildcard(re) = &sub.mode {
                    if re.is_match(string_id) {
                        matches.push(Arc::clone(sub));
                    }
                }
            }
        }
        matches
    }

    // ========== Introspection ==========

    /// Distinct subscription records
    pub fn subscription_count(&self) -> usize {
        let tables = self.tables.read();
        let keys: FxHashSet<*const Subscription> = tables.all().map(Arc::as_ptr).collect();
        keys.len()
    }

    pub fn subscriber_count(&self) -> usize {
        let tables = self.tables.read();
        let ids: FxHashSet<&str> = tables.all().map(|s| s.subscriber_id.as_str()).collect();
        ids.len()
    }

    /// Keys of all registrations held for a subscriber
    pub fn subscription_keys(&self, subscriber_id: &str) -> Vec<String> {
        let tables = self.tables.read();
        let mut keys: Vec<String> = tables
            .all()
            .filter(|s| s.belongs_to(subscriber_id))
            .map(|s| s.key.clone())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

/// Translate a `*` glob into an anchored regex
fn compile_wildcard(pattern: &str) -> Result<Regex> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{}$", body))
        .map_err(|e| RtdbError::InvalidVariable(format!("bad pattern '{}': {}", pattern, e)))
}

async fn notify_worker(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<NotifyTask>>>,
    cancel: CancellationToken,
    stats: Arc<DispatcherStats>,
    timeout: Duration,
) {
    loop {
        let task = tokio::select! {
            _ = cancel.cancelled() => break,
            task = async { rx.lock().await.recv().await } => task,
        };
        let Some(task) = task else {
            break;
        };
        deliver(task, timeout, &stats).await;
    }
    debug!("Notification worker {} exited", worker_id);
}

async fn deliver(task: NotifyTask, timeout: Duration, stats: &DispatcherStats) {
    let NotifyTask {
        subscription,
        update,
    } = task;
    let callback = Arc::clone(&subscription.callback);
    let handle = tokio::task::spawn_blocking(move || callback(update));

    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(())) => {
            stats.delivered.fetch_add(1, Ordering::Relaxed);
        },
        Ok(Err(e)) if e.is_panic() => {
            stats.panics.fetch_add(1, Ordering::Relaxed);
            error!("Subscriber callback panicked: {}", subscription.key);
        },
        Ok(Err(e)) => {
            warn!("Subscriber callback aborted ({}): {}", subscription.key, e);
        },
        Err(_) => {
            // The blocking task keeps running; it is only no longer awaited
            stats.timeouts.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Subscriber callback exceeded {:?}, abandoned: {}",
                timeout, subscription.key
            );
        },
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use chrono::Utc;
    use scada_model::{QualityCode, Value};
    use std::sync::atomic::AtomicUsize;

    fn update(id: u64) -> VariableUpdate {
        VariableUpdate {
            variable_id: id,
            value: Value::Float(1.0),
            quality: QualityCode::Good,
            timestamp: Utc::now(),
        }
    }

    fn noop() -> UpdateCallback {
        Arc::new(|_: VariableUpdate| {})
    }

    #[test]
    fn test_wildcard_compile() {
        let re = compile_wildcard("DV-*-TEMP*").unwrap();
        assert!(re.is_match("DV-PLC001-TEMP01"));
        assert!(!re.is_match("SV-PLC001-TEMP01"));
        let dotted = compile_wildcard("DV-A.B-*").unwrap();
        assert!(!dotted.is_match("DV-AxB-1"));
    }

    #[test]
    fn test_subscription_keys() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        dispatcher.subscribe("alarm", &[1, 2], noop());
        dispatcher.subscribe_by_device("alarm", "PLC001", noop());
        dispatcher.subscribe_by_pattern("alarm", "DV-PLC001-", noop()).unwrap();

        assert_eq!(
            dispatcher.subscription_keys("alarm"),
            vec![
                "alarm-device-PLC001".to_string(),
                "alarm-exact-[1, 2]".to_string(),
                "alarm-pattern-DV-PLC001-".to_string(),
            ]
        );
        assert_eq!(dispatcher.subscription_count(), 3);
        assert_eq!(dispatcher.subscriber_count(), 1);
    }

    #[test]
    fn test_unsubscribe_all_removes_every_mode() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        dispatcher.subscribe("hmi", &[1], noop());
        dispatcher.subscribe("hmi", &[2], noop());
        dispatcher.subscribe_by_pattern("hmi", "DV-*", noop()).unwrap();
        dispatcher.subscribe("alarm-1", &[1], noop());
        dispatcher.subscribe("alarm-10", &[1], noop());

        dispatcher.unsubscribe_all("hmi");
        assert!(dispatcher.subscription_keys("hmi").is_empty());

        dispatcher.unsubscribe_all("alarm-1");
        assert_eq!(dispatcher.subscription_keys("alarm-10").len(), 1);
        assert_eq!(dispatcher.subscriber_count(), 1);
    }

    #[test]
    fn test_unsubscribe_specific_ids() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        dispatcher.subscribe("hmi", &[1, 2], noop());
        dispatcher.unsubscribe("hmi", &[1]);

        assert!(dispatcher.matching(1, "", "").is_empty());
        assert_eq!(dispatcher.matching(2, "", "").len(), 1);
    }

    #[test]
    fn test_matching_modes() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        dispatcher.subscribe("a", &[7], noop());
        dispatcher.subscribe_by_device("b", "PLC001", noop());
        dispatcher.subscribe_by_pattern("c", "DV-PLC001-", noop()).unwrap();
        dispatcher.subscribe_by_pattern("d", "*-TEMP", noop()).unwrap();
        dispatcher.subscribe_by_pattern("e", "DV-PLC001-TEMP", noop()).unwrap();
        dispatcher.subscribe_by_pattern("f", "DV-PLC002-", noop()).unwrap();

        let matched = dispatcher.matching(7, "DV-PLC001-TEMP", "PLC001");
        let mut subscribers: Vec<&str> = matched.iter().map(|s| s.subscriber_id.as_str()).collect();
        subscribers.sort();
        assert_eq!(subscribers, vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_publish_delivers_to_callback() {
        let dispatcher = Dispatcher::new(DispatcherConfig {
            workers: 2,
            ..Default::default()
        });
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        dispatcher.subscribe(
            "hmi",
            &[5],
            Arc::new(move |u: VariableUpdate| {
                assert_eq!(u.variable_id, 5);
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        dispatcher.start().unwrap();

        dispatcher.publish(5, "", "", &update(5));
        dispatcher.publish(6, "", "", &update(6));

        for _ in 0..50 {
            if hits.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_queue_full_drops_without_blocking() {
        // Workers never started, so the queue only fills up
        let dispatcher = Dispatcher::new(DispatcherConfig {
            queue_size: 2,
            workers: 1,
            callback_timeout_ms: 100,
        });
        dispatcher.subscribe("hmi", &[1], noop());

        for _ in 0..5 {
            dispatcher.publish(1, "", "", &update(1));
        }
        assert_eq!(dispatcher.stats().dropped.load(Ordering::Relaxed), 3);
        assert_eq!(dispatcher.stats().published.load(Ordering::Relaxed), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_callback_is_contained() {
        let dispatcher = Dispatcher::new(DispatcherConfig {
            workers: 1,
            ..Default::default()
        });
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        dispatcher.subscribe("bad", &[1], Arc::new(|_: VariableUpdate| panic!("subscriber bug")));
        dispatcher.subscribe(
            "good",
            &[1],
            Arc::new(move |_: VariableUpdate| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        dispatcher.start().unwrap();

        dispatcher.publish(1, "", "", &update(1));
        dispatcher.publish(1, "", "", &update(1));

        for _ in 0..100 {
            if hits.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.stats().panics.load(Ordering::Relaxed), 2);
        dispatcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_callback_is_abandoned() {
        let dispatcher = Dispatcher::new(DispatcherConfig {
            workers: 1,
            queue_size: 16,
            callback_timeout_ms: 20,
        });
        dispatcher.subscribe(
            "slow",
            &[1],
            Arc::new(|_: VariableUpdate| std::thread::sleep(Duration::from_millis(200))),
        );
        dispatcher.start().unwrap();
        dispatcher.publish(1, "", "", &update(1));

        for _ in 0..50 {
            if dispatcher.stats().timeouts.load(Ordering::Relaxed) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(dispatcher.stats().timeouts.load(Ordering::Relaxed), 1);
        dispatcher.stop().await;
    }
}
