//! Alarm Consumer
//!
//! Subscribes to the variable store, queues one evaluation task per affected
//! rule and drives the state machine from the evaluation outcome:
//!
//! - Shielded: shielded record, no transition
//! - Triggered (Inactive/Cleared): Active, new ActiveAlarm, trigger record, trigger actions
//! - Not triggered (Active/Acknowledged): recovery confirmation timer, then Cleared
//!
//! The evaluation queue is bounded; a full queue drops the task with a warning.

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use scada_model::{AlarmState, VariableUpdate};
use scada_rtdb::{UpdateCallback, VariableStorage};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::action::{ActionExecutor, LoggingActionExecutor};
use crate::alarm::ActiveAlarm;
use crate::condition::Condition;
use crate::content::{render_message, ContentRenderer};
use crate::engine::{AlarmStateMachine, ConditionEvaluator, RuleOutcome};
use crate::error::{AlarmError, Result};
use crate::record::RecordManager;
use crate::rule::{Action, AlarmRule};
use crate::rule_manager::RuleManager;

/// Subscriber ID used in aggregated mode
pub const AGGREGATED_SUBSCRIBER: &str = "alarm-consumer";

pub type StoreEvaluator = ConditionEvaluator<dyn VariableStorage>;

/// Consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmConsumerConfig {
    /// Evaluation workers; the queue holds twice as many tasks
    pub eval_workers: usize,
    /// Upper bound on one rule evaluation
    pub eval_timeout_ms: u64,
    /// Time a raised alarm must stay unsatisfied before it clears
    pub recover_delay_ms: u64,
    /// Subscribe to rule variables on start and on rule changes
    pub auto_subscribe: bool,
    /// Rule count at which one aggregated subscription replaces per-rule ones
    pub aggregate_threshold: usize,
}

impl Default for AlarmConsumerConfig {
    fn default() -> Self {
        Self {
            eval_workers: 10,
            eval_timeout_ms: 100,
            recover_delay_ms: 3000,
            auto_subscribe: true,
            aggregate_threshold: 100,
        }
    }
}

impl AlarmConsumerConfig {
    pub fn queue_capacity(&self) -> usize {
        self.eval_workers.max(1) * 2
    }

    pub fn eval_timeout(&self) -> Duration {
        Duration::from_millis(self.eval_timeout_ms)
    }

    pub fn recover_delay(&self) -> Duration {
        Duration::from_millis(self.recover_delay_ms)
    }
}

/// Consumer counters snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsumerStats {
    pub evaluations: u64,
    pub dropped_tasks: u64,
    pub evaluation_errors: u64,
    pub triggers: u64,
    pub recoveries: u64,
    pub shielded: u64,
    pub active_alarms: usize,
    pub running: bool,
}

#[derive(Default)]
struct Counters {
    evaluations: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
    triggers: AtomicU64,
    recoveries: AtomicU64,
    shielded: AtomicU64,
}

struct RecoveryTimer {
    generation: u64,
    cancel: CancellationToken,
}

struct ConsumerInner {
    config: AlarmConsumerConfig,
    storage: Arc<dyn VariableStorage>,
    rules: Arc<RuleManager>,
    evaluator: Arc<StoreEvaluator>,
    state_machine: AlarmStateMachine,
    records: Arc<RecordManager>,
    actions: RwLock<Arc<dyn ActionExecutor>>,
    renderer: RwLock<Option<Arc<dyn ContentRenderer>>>,

    /// Raised alarms by rule ID
    active: RwLock<FxHashMap<String, ActiveAlarm>>,
    recover_timers: Mutex<FxHashMap<String, RecoveryTimer>>,
    next_timer: AtomicU64,

    eval_tx: mpsc::Sender<String>,
    eval_rx: Mutex<Option<mpsc::Receiver<String>>>,
    subscriptions: Mutex<Vec<String>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    cancel: CancellationToken,
    counters: Arc<Counters>,
}

pub struct AlarmConsumer {
    inner: Arc<ConsumerInner>,
}

impl AlarmConsumer {
    pub fn new(
        config: AlarmConsumerConfig,
        storage: Arc<dyn VariableStorage>,
        rules: Arc<RuleManager>,
        records: Arc<RecordManager>,
    ) -> Self {
        let (eval_tx, eval_rx) = mpsc::channel(config.queue_capacity());
        let counters = Arc::new(Counters::default());
        let cancel = CancellationToken::new();
        let evaluator = Arc::new(ConditionEvaluator::with_cancel(Arc::clone(&storage), cancel.clone()));

        // Delay expiry re-queues the rule; the next evaluation reports Triggered
        let delay_tx = eval_tx.clone();
        let delay_counters = Arc::clone(&counters);
        evaluator.set_delay_handler(Arc::new(move |rule_id: String| {
            enqueue(&delay_tx, &delay_counters, rule_id);
        }));

        Self {
            inner: Arc::new(ConsumerInner {
                config,
                storage,
                rules,
                evaluator,
                state_machine: AlarmStateMachine::new(),
                records,
                actions: RwLock::new(Arc::new(LoggingActionExecutor)),
                renderer: RwLock::new(None),
                active: RwLock::new(FxHashMap::default()),
                recover_timers: Mutex::new(FxHashMap::default()),
                next_timer: AtomicU64::new(0),
                eval_tx,
                eval_rx: Mutex::new(Some(eval_rx)),
                subscriptions: Mutex::new(Vec::new()),
                workers: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                cancel,
                counters,
            }),
        }
    }

    pub fn set_action_executor(&self, executor: Arc<dyn ActionExecutor>) {
        *self.inner.actions.write() = executor;
    }

    pub fn set_renderer(&self, renderer: Arc<dyn ContentRenderer>) {
        *self.inner.renderer.write() = Some(renderer);
    }

    pub fn config(&self) -> &AlarmConsumerConfig {
        &self.inner.config
    }

    // ========== Lifecycle ==========

    /// Start the record manager, the evaluation workers and (optionally) the
    /// store subscriptions
    pub async fn start(&self) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(AlarmError::NotRunning);
        }
        let Some(rx) = self.inner.eval_rx.lock().take() else {
            return Err(AlarmError::AlreadyRunning);
        };

        match self.inner.records.start() {
            Ok(()) | Err(AlarmError::AlreadyRunning) => {},
            Err(e) => return Err(e),
        }

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        {
            let mut workers = self.inner.workers.lock();
            for worker_id in 0..self.inner.config.eval_workers.max(1) {
                let inner = Arc::clone(&self.inner);
                let rx = Arc::clone(&rx);
                workers.push(tokio::spawn(eval_worker(worker_id, inner, rx)));
            }
        }

        self.inner.running.store(true, Ordering::SeqCst);
        if self.inner.config.auto_subscribe {
            self.inner.refresh_subscriptions()?;
        }

        info!(
            "Alarm consumer started: {} rules, {} workers, queue {}",
            self.inner.rules.count(),
            self.inner.config.eval_workers,
            self.inner.config.queue_capacity()
        );
        Ok(())
    }

    /// Cancel, drain workers, unsubscribe, stop the record manager
    pub async fn stop(&self) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Stopping alarm consumer");

        self.inner.cancel.cancel();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Evaluation worker ended abnormally: {}", e);
            }
        }
        self.inner.recover_timers.lock().clear();
        self.inner.evaluator.reset();

        self.inner.unsubscribe_all();
        self.inner.records.stop().await;

        info!("Alarm consumer stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    // ========== Rules ==========

    pub fn add_rule(&self, rule: AlarmRule) -> Result<()> {
        self.inner.rules.add_rule(rule)?;
        self.resubscribe_if_running()
    }

    /// Remove a rule and drop its runtime state
    pub fn remove_rule(&self, rule_id: &str) -> Result<AlarmRule> {
        let rule = self.inner.rules.remove_rule(rule_id)?;
        self.inner.cancel_recovery(rule_id);
        self.inner.evaluator.clear_rule(rule_id);
        self.inner.state_machine.clear(rule_id);
        self.inner.active.write().remove(rule_id);
        self.resubscribe_if_running()?;
        Ok(rule)
    }

    fn resubscribe_if_running(&self) -> Result<()> {
        if self.is_running() && self.inner.config.auto_subscribe {
            self.inner.refresh_subscriptions()?;
        }
        Ok(())
    }

    /// Queue an evaluation of one rule outside the subscription path
    pub fn request_evaluation(&self, rule_id: &str) -> Result<()> {
        if !self.is_running() {
            return Err(AlarmError::NotRunning);
        }
        enqueue(&self.inner.eval_tx, &self.inner.counters, rule_id.to_string());
        Ok(())
    }

    // ========== Alarms ==========

    /// Active -> Acknowledged, stamping the user on the live alarm
    pub fn acknowledge(&self, rule_id: &str, user: &str) -> Result<ActiveAlarm> {
        // Held across the transition; triggers insert under the same lock
        let mut active = self.inner.active.write();
        let state = self.inner.state_machine.get_state(rule_id);
        let Some(alarm) = active.get_mut(rule_id).filter(|_| state == AlarmState::Active) else {
            return Err(AlarmError::NotAcknowledgeable {
                rule_id: rule_id.to_string(),
                state,
            });
        };
        self.inner
            .state_machine
            .transition(rule_id, AlarmState::Acknowledged, "acknowledged", Some(user))?;

        alarm.state = AlarmState::Acknowledged;
        alarm.ack_user = Some(user.to_string());
        alarm.ack_time = Some(chrono::Utc::now());
        info!(rule_id = %rule_id, "Alarm acknowledged by {}", user);
        Ok(alarm.clone())
    }

    /// Copies of the raised alarms, ordered by rule ID
    pub fn get_active_alarms(&self) -> Vec<ActiveAlarm> {
        let mut alarms: Vec<ActiveAlarm> = self.inner.active.read().values().cloned().collect();
        alarms.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
        alarms
    }

    pub fn get_active_alarm(&self, rule_id: &str) -> Option<ActiveAlarm> {
        self.inner.active.read().get(rule_id).cloned()
    }

    pub fn get_state_machine(&self) -> &AlarmStateMachine {
        &self.inner.state_machine
    }

    pub fn rule_manager(&self) -> &Arc<RuleManager> {
        &self.inner.rules
    }

    pub fn evaluator(&self) -> &Arc<StoreEvaluator> {
        &self.inner.evaluator
    }

    pub fn record_manager(&self) -> &Arc<RecordManager> {
        &self.inner.records
    }

    /// Subscriber IDs currently registered with the store
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.subscriptions.lock().clone()
    }

    pub fn stats(&self) -> ConsumerStats {
        let c = &self.inner.counters;
        ConsumerStats {
            evaluations: c.evaluations.load(Ordering::Relaxed),
            dropped_tasks: c.dropped.load(Ordering::Relaxed),
            evaluation_errors: c.errors.load(Ordering::Relaxed),
            triggers: c.triggers.load(Ordering::Relaxed),
            recoveries: c.recoveries.load(Ordering::Relaxed),
            shielded: c.shielded.load(Ordering::Relaxed),
            active_alarms: self.inner.active.read().len(),
            running: self.is_running(),
        }
    }
}

fn enqueue(tx: &mpsc::Sender<String>, counters: &Counters, rule_id: String) {
    match tx.try_send(rule_id) {
        Ok(()) => {},
        Err(TrySendError::Full(rule_id)) => {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Evaluation queue full, dropping task for rule {}", rule_id);
        },
        Err(TrySendError::Closed(rule_id)) => {
            debug!("Evaluation queue closed, task for {} discarded", rule_id);
        },
    }
}

/// First variable of a condition tree, depth first
fn primary_variable(condition: &Condition) -> Option<u64> {
    match condition {
        Condition::Single(single) => Some(single.variable_id),
        Condition::Group(group) => group.conditions.iter().find_map(primary_variable),
    }
}

async fn eval_worker(
    worker_id: usize,
    inner: Arc<ConsumerInner>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
) {
    debug!("Evaluation worker {} started", worker_id);
    loop {
        let rule_id = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            next = async { rx.lock().await.recv().await } => match next {
                Some(rule_id) => rule_id,
                None => break,
            },
        };

        // Own task per evaluation so a panic stays contained
        let task_inner = Arc::clone(&inner);
        let task_rule = rule_id.clone();
        let handle = tokio::spawn(async move { task_inner.process_rule(&task_rule).await });
        if let Err(e) = handle.await {
            inner.counters.errors.fetch_add(1, Ordering::Relaxed);
            error!("Evaluation task for rule {} failed: {}", rule_id, e);
        }
    }
    debug!("Evaluation worker {} exited", worker_id);
}

impl ConsumerInner {
    // ========== Subscriptions ==========

    fn subscription_callback(&self, rule_id: Option<String>) -> UpdateCallback {
        let tx = self.eval_tx.clone();
        let counters = Arc::clone(&self.counters);
        let rules = Arc::clone(&self.rules);
        Arc::new(move |update: VariableUpdate| match &rule_id {
            Some(rule_id) => enqueue(&tx, &counters, rule_id.clone()),
            None => {
                for rule in rules.rules_for_variable(update.variable_id) {
                    enqueue(&tx, &counters, rule.id);
                }
            },
        })
    }

    /// Rebuild all store subscriptions from the current enabled rule set
    fn refresh_subscriptions(&self) -> Result<()> {
        let mut subscriptions = self.subscriptions.lock();
        for subscriber in subscriptions.drain(..) {
            if let Err(e) = self.storage.unsubscribe_all(&subscriber) {
                warn!("Failed to unsubscribe {}: {}", subscriber, e);
            }
        }

        let rules = self.rules.list_enabled_rules();
        if rules.len() < self.config.aggregate_threshold {
            for rule in &rules {
                let variables = self.rules.variables_for_rule(&rule.id);
                if variables.is_empty() {
                    continue;
                }
                let subscriber = format!("alarm-{}", rule.id);
                self.storage
                    .subscribe(&subscriber, &variables, self.subscription_callback(Some(rule.id.clone())))?;
                subscriptions.push(subscriber);
            }
            debug!("Subscribed {} rule(s) individually", subscriptions.len());
        } else {
            let variables = self.rules.variable_ids();
            self.storage
                .subscribe(AGGREGATED_SUBSCRIBER, &variables, self.subscription_callback(None))?;
            subscriptions.push(AGGREGATED_SUBSCRIBER.to_string());
            debug!(
                "Aggregated subscription over {} variable(s) for {} rules",
                variables.len(),
                rules.len()
            );
        }
        Ok(())
    }

    fn unsubscribe_all(&self) {
        for subscriber in self.subscriptions.lock().drain(..) {
            if let Err(e) = self.storage.unsubscribe_all(&subscriber) {
                warn!("Failed to unsubscribe {}: {}", subscriber, e);
            }
        }
    }

    // ========== Evaluation ==========

    async fn evaluate(&self, rule: &AlarmRule) -> Option<RuleOutcome> {
        self.counters.evaluations.fetch_add(1, Ordering::Relaxed);
        match tokio::time::timeout(self.config.eval_timeout(), self.evaluator.evaluate_rule(rule)).await {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(e)) if e.is_bad_quality() => {
                debug!(rule_id = %rule.id, "Evaluation skipped: {}", e);
                None
            },
            Ok(Err(e)) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(rule_id = %rule.id, "Evaluation failed: {}", e);
                None
            },
            Err(_) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(rule_id = %rule.id, "Evaluation timed out after {:?}", self.config.eval_timeout());
                None
            },
        }
    }

    async fn process_rule(self: &Arc<Self>, rule_id: &str) {
        let Some(rule) = self.rules.get_rule(rule_id) else {
            debug!("Rule {} no longer registered", rule_id);
            return;
        };
        if !rule.enabled {
            return;
        }
        if let Some(outcome) = self.evaluate(&rule).await {
            self.apply_outcome(&rule, outcome).await;
        }
    }

    async fn apply_outcome(self: &Arc<Self>, rule: &AlarmRule, outcome: RuleOutcome) {
        let raised = self.state_machine.get_state(&rule.id).is_raised();
        match outcome {
            RuleOutcome::Shielded => self.on_shielded(rule).await,
            RuleOutcome::Triggered if !raised => self.on_trigger(rule).await,
            RuleOutcome::Triggered => {
                self.cancel_recovery(&rule.id);
            },
            RuleOutcome::Pending if raised => {
                // Already raised: satisfaction needs no second confirmation
                self.cancel_recovery(&rule.id);
                self.evaluator.confirm_delay(&rule.id);
            },
            RuleOutcome::NotTriggered if raised => self.schedule_recovery(&rule.id),
            RuleOutcome::Pending | RuleOutcome::NotTriggered => {},
        }
    }

    async fn on_shielded(&self, rule: &AlarmRule) {
        let message = format!("{} shielded by enable condition", rule.name);
        if let Err(e) = self.records.record_shielded(rule, &message).await {
            error!(rule_id = %rule.id, "Failed to record shielded event: {}", e);
        }
        self.counters.shielded.fetch_add(1, Ordering::Relaxed);
    }

    async fn on_trigger(&self, rule: &AlarmRule) {
        let trigger_value = match primary_variable(&rule.condition) {
            Some(id) => self.storage.read(id).await.ok().map(|v| v.value),
            None => None,
        };
        let renderer = self.renderer.read().clone();
        let message = render_message(renderer.as_deref(), rule, &*self.storage).await;
        let alarm = ActiveAlarm::new(rule, trigger_value, message);

        // The state change and the active entry become visible together
        {
            let mut active = self.active.write();
            if let Err(e) = self
                .state_machine
                .transition(&rule.id, AlarmState::Active, "condition triggered", None)
            {
                // Lost a race with another worker for the same rule
                debug!(rule_id = %rule.id, "Trigger skipped: {}", e);
                return;
            }
            active.insert(rule.id.clone(), alarm.clone());
        }
        self.cancel_recovery(&rule.id);
        self.counters.triggers.fetch_add(1, Ordering::Relaxed);
        warn!(rule_id = %rule.id, level = %rule.level, "Alarm triggered: {}", alarm.message);

        if let Err(e) = self.records.record_trigger(rule, &alarm).await {
            error!(rule_id = %rule.id, "Failed to record trigger: {}", e);
        }
        self.spawn_actions(&rule.trigger_actions, alarm);
    }

    // ========== Recovery ==========

    fn schedule_recovery(self: &Arc<Self>, rule_id: &str) {
        let generation = self.next_timer.fetch_add(1, Ordering::Relaxed);
        let token = self.cancel.child_token();
        {
            let mut timers = self.recover_timers.lock();
            if timers.contains_key(rule_id) {
                return;
            }
            timers.insert(
                rule_id.to_string(),
                RecoveryTimer {
                    generation,
                    cancel: token.clone(),
                },
            );
        }

        let delay = self.config.recover_delay();
        debug!("Recovery confirmation for {} in {:?}", rule_id, delay);
        let inner = Arc::clone(self);
        let rule_id = rule_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {},
            }
            {
                let mut timers = inner.recover_timers.lock();
                match timers.get(&rule_id) {
                    Some(timer) if timer.generation == generation => {
                        timers.remove(&rule_id);
                    },
                    _ => return,
                }
            }
            inner.confirm_recovery(&rule_id).await;
        });
    }

    fn cancel_recovery(&self, rule_id: &str) {
        if let Some(timer) = self.recover_timers.lock().remove(rule_id) {
            timer.cancel.cancel();
            debug!("Recovery of {} abandoned", rule_id);
        }
    }

    async fn confirm_recovery(&self, rule_id: &str) {
        let Some(rule) = self.rules.get_rule(rule_id) else {
            return;
        };
        match self.evaluate(&rule).await {
            Some(RuleOutcome::NotTriggered) => self.on_recover(&rule).await,
            other => debug!("Recovery of {} not confirmed ({:?})", rule_id, other),
        }
    }

    async fn on_recover(&self, rule: &AlarmRule) {
        if let Err(e) = self
            .state_machine
            .transition(&rule.id, AlarmState::Cleared, "condition recovered", None)
        {
            warn!(rule_id = %rule.id, "Recovery rejected: {}", e);
            return;
        }

        let now = chrono::Utc::now();
        let alarm = self.active.write().remove(&rule.id).map(|mut alarm| {
            alarm.state = AlarmState::Cleared;
            alarm.recover_time = Some(now);
            alarm
        });
        self.counters.recoveries.fetch_add(1, Ordering::Relaxed);
        info!(rule_id = %rule.id, "Alarm recovered: {}", rule.name);

        if let Err(e) = self.records.record_recover(rule, alarm.as_ref()).await {
            error!(rule_id = %rule.id, "Failed to record recovery: {}", e);
        }
        let alarm = alarm.unwrap_or_else(|| {
            let mut alarm = ActiveAlarm::new(rule, None, rule.name.clone());
            alarm.state = AlarmState::Cleared;
            alarm.recover_time = Some(now);
            alarm
        });
        self.spawn_actions(&rule.recover_actions, alarm);
    }

    fn spawn_actions(&self, actions: &[Action], alarm: ActiveAlarm) {
        if actions.is_empty() {
            return;
        }
        let executor = Arc::clone(&*self.actions.read());
        let actions = actions.to_vec();
        tokio::spawn(async move {
            if let Err(e) = executor.execute_batch(&actions, &alarm).await {
                warn!(rule_id = %alarm.rule_id, "Actions failed: {:#}", e);
            }
        });
    }
}
