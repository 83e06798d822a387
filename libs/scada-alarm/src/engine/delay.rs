//! Trigger delay timers, one per rule
//!
//! A satisfied delayed condition arms a timer; the rule only reports
//! triggered once the timer has elapsed. Losing satisfaction cancels the
//! timer. Expiry is announced through the registered handler.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Called with the rule ID when a delay elapses
pub type DelayHandler = Arc<dyn Fn(String) + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayStatus {
    /// Timer running
    Armed,
    /// Timer finished while the condition held
    Elapsed,
}

enum DelayEntry {
    Armed { generation: u64, cancel: CancellationToken },
    Elapsed,
}

#[derive(Default)]
struct DelayTable {
    entries: FxHashMap<String, DelayEntry>,
    next_generation: u64,
}

pub struct DelayTracker {
    table: Arc<Mutex<DelayTable>>,
    handler: Arc<Mutex<Option<DelayHandler>>>,
    /// Every timer token is a child of this one
    parent: CancellationToken,
}

impl Default for DelayTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayTracker {
    pub fn new() -> Self {
        Self::with_parent(CancellationToken::new())
    }

    /// Timers stop when `parent` is cancelled
    pub fn with_parent(parent: CancellationToken) -> Self {
        Self {
            table: Arc::new(Mutex::new(DelayTable::default())),
            handler: Arc::new(Mutex::new(None)),
            parent,
        }
    }

    pub fn set_handler(&self, handler: DelayHandler) {
        *self.handler.lock() = Some(handler);
    }

    /// Condition currently satisfied: arm if idle, report current status
    ///
    /// Must be called inside a tokio runtime.
    pub fn satisfied(&self, rule_id: &str, delay: Duration) -> DelayStatus {
        let mut table = self.table.lock();
        match table.entries.get(rule_id) {
            Some(DelayEntry::Elapsed) => return DelayStatus::Elapsed,
            Some(DelayEntry::Armed { .. }) => return DelayStatus::Armed,
            None => {},
        }

        let generation = table.next_generation;
        table.next_generation += 1;
        let cancel = self.parent.child_token();
        table.entries.insert(
            rule_id.to_string(),
            DelayEntry::Armed {
                generation,
                cancel: cancel.clone(),
            },
        );
        drop(table);

        debug!("Delay armed for rule {} ({:?})", rule_id, delay);
        let table = Arc::clone(&self.table);
        let handler = Arc::clone(&self.handler);
        let rule_id = rule_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {},
                _ = tokio::time::sleep(delay) => {
                    let fired = {
                        let mut table = table.lock();
                        match table.entries.get(&rule_id) {
                            Some(DelayEntry::Armed { generation: g, .. }) if *g == generation => {
                                table.entries.insert(rule_id.clone(), DelayEntry::Elapsed);
                                true
                            },
                            _ => false,
                        }
                    };
                    if fired {
                        debug!("Delay elapsed for rule {}", rule_id);
                        let handler = handler.lock().clone();
                        if let Some(handler) = handler {
                            handler(rule_id);
                        }
                    }
                },
            }
        });
        DelayStatus::Armed
    }

    /// Condition no longer satisfied: cancel and forget
    pub fn disarm(&self, rule_id: &str) -> bool {
        match self.table.lock().entries.remove(rule_id) {
            Some(DelayEntry::Armed { cancel, .. }) => {
                cancel.cancel();
                debug!("Delay disarmed for rule {}", rule_id);
                true
            },
            Some(DelayEntry::Elapsed) => true,
            None => false,
        }
    }

    /// Treat the delay as already satisfied without waiting
    pub fn confirm(&self, rule_id: &str) {
        let mut table = self.table.lock();
        if let Some(DelayEntry::Armed { cancel, .. }) = table.entries.get(rule_id) {
            cancel.cancel();
        }
        table.entries.insert(rule_id.to_string(), DelayEntry::Elapsed);
    }

    pub fn status(&self, rule_id: &str) -> Option<DelayStatus> {
        self.table.lock().entries.get(rule_id).map(|e| match e {
            DelayEntry::Armed { .. } => DelayStatus::Armed,
            DelayEntry::Elapsed => DelayStatus::Elapsed,
        })
    }

    pub fn armed_count(&self) -> usize {
        self.table
            .lock()
            .entries
            .values()
            .filter(|e| matches!(e, DelayEntry::Armed { .. }))
            .count()
    }

    /// Cancel every timer
    pub fn reset(&self) {
        let mut table = self.table.lock();
        for (_, entry) in table.entries.drain() {
            if let DelayEntry::Armed { cancel, .. } = entry {
                cancel.cancel();
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_tracker() -> (DelayTracker, Arc<AtomicUsize>) {
        let tracker = DelayTracker::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        tracker.set_handler(Arc::new(move |_: String| {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        (tracker, fired)
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapses_after_delay() {
        let (tracker, fired) = counting_tracker();
        let delay = Duration::from_millis(500);

        assert_eq!(tracker.satisfied("R1", delay), DelayStatus::Armed);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(tracker.satisfied("R1", delay), DelayStatus::Armed);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.satisfied("R1", delay), DelayStatus::Elapsed);
        assert_eq!(tracker.satisfied("R1", delay), DelayStatus::Elapsed);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_before_expiry() {
        let (tracker, fired) = counting_tracker();
        tracker.satisfied("R1", Duration::from_millis(500));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(tracker.disarm("R1"));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.status("R1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_ignores_stale_timer() {
        let (tracker, fired) = counting_tracker();
        let delay = Duration::from_millis(500);
        tracker.satisfied("R1", delay);
        tokio::time::sleep(Duration::from_millis(400)).await;
        tracker.disarm("R1");
        tracker.satisfied("R1", delay);

        // First timer's deadline passes; only the second may fire
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(tracker.status("R1"), Some(DelayStatus::Armed));
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_confirm_and_reset() {
        let (tracker, fired) = counting_tracker();
        tracker.satisfied("R1", Duration::from_secs(60));
        tracker.satisfied("R2", Duration::from_secs(60));
        tracker.confirm("R1");
        assert_eq!(tracker.status("R1"), Some(DelayStatus::Elapsed));
        assert_eq!(tracker.armed_count(), 1);

        tracker.reset();
        assert_eq!(tracker.armed_count(), 0);
        assert_eq!(tracker.status("R1"), None);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancel_stops_timers() {
        let parent = CancellationToken::new();
        let tracker = DelayTracker::with_parent(parent.clone());
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        tracker.set_handler(Arc::new(move |_: String| {
            f.fetch_add(1, Ordering::SeqCst);
        }));

        tracker.satisfied("R1", Duration::from_millis(500));
        parent.cancel();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
