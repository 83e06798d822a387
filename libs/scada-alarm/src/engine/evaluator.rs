//! Condition Evaluator
//!
//! Evaluates a rule's enabling and primary conditions against the current
//! store contents, applying deadband, edge and delay filtering.

use futures::future::BoxFuture;
use scada_model::Variable;
use scada_rtdb::VariableStorage;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::deadband::DeadbandFilter;
use super::delay::{DelayHandler, DelayStatus, DelayTracker};
use super::edge::EdgeDetector;
use super::state_tracker::{ConditionState, StateTracker};
use crate::condition::{Condition, ConditionGroup, Logic, SingleCondition, Threshold};
use crate::error::{AlarmError, Result};
use crate::rule::AlarmRule;

/// Result of one rule evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOutcome {
    Triggered,
    NotTriggered,
    /// Satisfied, waiting for the trigger delay
    Pending,
    /// Enabling condition false; evaluation suppressed
    Shielded,
}

impl RuleOutcome {
    pub fn is_triggered(&self) -> bool {
        matches!(self, RuleOutcome::Triggered)
    }
}

pub struct ConditionEvaluator<S: VariableStorage + ?Sized> {
    storage: Arc<S>,
    states: Arc<StateTracker>,
    deadband: DeadbandFilter,
    edge: EdgeDetector,
    delays: DelayTracker,
}

impl<S: VariableStorage + ?Sized> ConditionEvaluator<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self::with_cancel(storage, CancellationToken::new())
    }

    /// Delay timers are children of `cancel`
    pub fn with_cancel(storage: Arc<S>, cancel: CancellationToken) -> Self {
        let states = Arc::new(StateTracker::new());
        Self {
            storage,
            deadband: DeadbandFilter::new(Arc::clone(&states)),
            edge: EdgeDetector::new(Arc::clone(&states)),
            states,
            delays: DelayTracker::with_parent(cancel),
        }
    }

    /// Callback fired with the rule ID when a trigger delay elapses
    pub fn set_delay_handler(&self, handler: DelayHandler) {
        self.delays.set_handler(handler);
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    // ========== Rule Evaluation ==========

    pub async fn evaluate_rule(&self, rule: &AlarmRule) -> Result<RuleOutcome> {
        if !rule.enabled {
            return Ok(RuleOutcome::NotTriggered);
        }

        if let Some(enable) = &rule.enable_condition {
            if !self.evaluate_condition(enable).await? {
                debug!("Rule {} shielded by enable condition", rule.id);
                return Ok(RuleOutcome::Shielded);
            }
        }

        let satisfied = self.evaluate_condition(&rule.condition).await?;
        let delay_ms = rule.condition.delay_ms();

        if delay_ms == 0 {
            return Ok(if satisfied {
                RuleOutcome::Triggered
            } else {
                RuleOutcome::NotTriggered
            });
        }

        if !satisfied {
            self.delays.disarm(&rule.id);
            return Ok(RuleOutcome::NotTriggered);
        }

        match self
            .delays
            .satisfied(&rule.id, Duration::from_millis(delay_ms))
        {
            DelayStatus::Elapsed => Ok(RuleOutcome::Triggered),
            DelayStatus::Armed => Ok(RuleOutcome::Pending),
        }
    }

    /// Evaluate a condition tree
    pub fn evaluate_condition<'a>(&'a self, condition: &'a Condition) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            match condition {
                Condition::Single(single) => self.evaluate_single(single).await,
                Condition::Group(group) => self.evaluate_group(group).await,
            }
        })
    }

    async fn evaluate_group(&self, group: &ConditionGroup) -> Result<bool> {
        if group.conditions.is_empty() {
            return Err(AlarmError::EmptyGroup);
        }

        for child in &group.conditions {
            let result = match self.evaluate_condition(child).await {
                Ok(result) => result,
                Err(AlarmError::EmptyGroup) => return Err(AlarmError::EmptyGroup),
                Err(e) => {
                    // A failing child counts as unsatisfied; siblings still run
                    warn!("Condition {} failed: {}", child, e);
                    false
                },
            };
            match (group.logic, result) {
                (Logic::And, false) => return Ok(false),
                (Logic::Or, true) => return Ok(true),
                _ => {},
            }
        }
        Ok(matches!(group.logic, Logic::And))
    }

    async fn evaluate_single(&self, condition: &SingleCondition) -> Result<bool> {
        let variable = self.read_good(condition.variable_id).await?;

        if condition.operator.is_edge() {
            let current = variable.value.as_bool()?;
            return Ok(self
                .edge
                .detect(condition.variable_id, condition.operator, current));
        }

        let threshold = match &condition.threshold {
            Some(Threshold::Static { value }) => value.as_f64()?,
            Some(Threshold::Variable { variable_id }) => {
                self.read_good(*variable_id).await?.value.as_f64()?
            },
            None => {
                return Err(AlarmError::InvalidCondition(format!(
                    "{} has no threshold",
                    condition
                )))
            },
        };
        let value = variable.value.as_f64()?;

        Ok(self.deadband.apply(
            condition.variable_id,
            condition.operator,
            value,
            threshold,
            condition.deadband,
        ))
    }

    async fn read_good(&self, variable_id: u64) -> Result<Variable> {
        let variable = self.storage.read(variable_id).await?;
        if !variable.quality.is_good() {
            return Err(AlarmError::BadQuality {
                variable_id,
                quality: variable.quality.to_string(),
            });
        }
        Ok(variable)
    }

    // ========== State Management ==========

    /// Cancel a pending trigger delay
    pub fn disarm_delay(&self, rule_id: &str) -> bool {
        self.delays.disarm(rule_id)
    }

    /// Mark a rule's trigger delay as satisfied, stopping its timer
    pub fn confirm_delay(&self, rule_id: &str) {
        self.delays.confirm(rule_id);
    }

    pub fn delay_status(&self, rule_id: &str) -> Option<DelayStatus> {
        self.delays.status(rule_id)
    }

    /// Drop per-rule memory (delay timers)
    pub fn clear_rule(&self, rule_id: &str) {
        self.delays.disarm(rule_id);
    }

    pub fn condition_state(&self, variable_id: u64) -> Option<ConditionState> {
        self.states.get(variable_id)
    }

    pub fn clear_variable(&self, variable_id: u64) {
        self.states.remove(variable_id);
    }

    /// Forget all condition memory and cancel all timers
    pub fn reset(&self) {
        self.states.clear();
        self.delays.reset();
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::condition::Operator;
    use scada_model::{QualityCode, Value};
    use scada_rtdb::MemoryStorage;

    async fn setup(values: &[(u64, Value)]) -> ConditionEvaluator<MemoryStorage> {
        let storage = Arc::new(MemoryStorage::new());
        for (id, value) in values {
            storage
                .write(Variable::new(*id, format!("DV-PLC001-V{}", id), "PLC001").with_value(value.clone()))
                .await
                .unwrap();
        }
        ConditionEvaluator::new(storage)
    }

    async fn set(evaluator: &ConditionEvaluator<MemoryStorage>, id: u64, value: impl Into<Value>) {
        evaluator
            .storage()
            .write(Variable::new(id, format!("DV-PLC001-V{}", id), "PLC001").with_value(value))
            .await
            .unwrap();
    }

    fn rule(condition: Condition) -> AlarmRule {
        AlarmRule::new("R1", "test", condition)
    }

    #[tokio::test]
    async fn test_numeric_conversion_in_comparison() {
        let evaluator = setup(&[(1, Value::Int(5)), (2, Value::Bool(true)), (3, Value::UInt(9))]).await;

        let gt = rule(SingleCondition::new(1, Operator::Gt, 4.5).into());
        assert_eq!(evaluator.evaluate_rule(&gt).await.unwrap(), RuleOutcome::Triggered);

        let eq = rule(SingleCondition::new(2, Operator::Eq, 1.0).into());
        assert_eq!(evaluator.evaluate_rule(&eq).await.unwrap(), RuleOutcome::Triggered);

        let lt = rule(SingleCondition::new(3, Operator::Lt, 9u64).into());
        assert_eq!(evaluator.evaluate_rule(&lt).await.unwrap(), RuleOutcome::NotTriggered);
    }

    #[tokio::test]
    async fn test_disabled_rule_not_triggered() {
        let evaluator = setup(&[(1, Value::Float(100.0))]).await;
        let mut r = rule(SingleCondition::new(1, Operator::Gt, 0.0).into());
        r.enabled = false;
        assert_eq!(evaluator.evaluate_rule(&r).await.unwrap(), RuleOutcome::NotTriggered);
    }

    #[tokio::test]
    async fn test_enable_condition_shields() {
        let evaluator = setup(&[(1, Value::Float(100.0)), (2, Value::Bool(false))]).await;
        let r = rule(SingleCondition::new(1, Operator::Gt, 0.0).into())
            .with_enable_condition(SingleCondition::new(2, Operator::Eq, true).into());
        assert_eq!(evaluator.evaluate_rule(&r).await.unwrap(), RuleOutcome::Shielded);

        set(&evaluator, 2, true).await;
        assert_eq!(evaluator.evaluate_rule(&r).await.unwrap(), RuleOutcome::Triggered);
    }

    #[tokio::test]
    async fn test_bad_quality_fails_single() {
        let evaluator = setup(&[]).await;
        evaluator
            .storage()
            .write(
                Variable::new(1, "DV-PLC001-V1", "PLC001")
                    .with_value(50.0)
                    .with_quality(QualityCode::Bad),
            )
            .await
            .unwrap();
        let r = rule(SingleCondition::new(1, Operator::Gt, 0.0).into());
        assert!(evaluator.evaluate_rule(&r).await.unwrap_err().is_bad_quality());
    }

    #[tokio::test]
    async fn test_group_tolerates_failing_child() {
        let evaluator = setup(&[(2, Value::Float(10.0))]).await;
        // Variable 1 missing: its child counts as false
        let or = rule(Condition::or(vec![
            SingleCondition::new(1, Operator::Gt, 0.0).into(),
            SingleCondition::new(2, Operator::Gt, 5.0).into(),
        ]));
        assert_eq!(evaluator.evaluate_rule(&or).await.unwrap(), RuleOutcome::Triggered);

        let and = rule(Condition::and(vec![
            SingleCondition::new(2, Operator::Gt, 5.0).into(),
            SingleCondition::new(1, Operator::Gt, 0.0).into(),
        ]));
        assert_eq!(evaluator.evaluate_rule(&and).await.unwrap(), RuleOutcome::NotTriggered);

        let empty = rule(Condition::and(vec![]));
        assert!(matches!(
            evaluator.evaluate_rule(&empty).await,
            Err(AlarmError::EmptyGroup)
        ));
    }

    #[tokio::test]
    async fn test_group_short_circuits() {
        // Edge state on variable 3 is only touched if the second child runs
        let evaluator = setup(&[(2, Value::Float(1.0)), (3, Value::Bool(true))]).await;
        let or = rule(Condition::or(vec![
            SingleCondition::new(2, Operator::Gt, 0.0).into(),
            SingleCondition::edge(3, Operator::RisingEdge).into(),
        ]));
        evaluator.evaluate_rule(&or).await.unwrap();
        assert!(evaluator.condition_state(3).is_none());

        let and = rule(Condition::and(vec![
            SingleCondition::new(2, Operator::Lt, 0.0).into(),
            SingleCondition::edge(3, Operator::RisingEdge).into(),
        ]));
        evaluator.evaluate_rule(&and).await.unwrap();
        assert!(evaluator.condition_state(3).is_none());
    }

    #[tokio::test]
    async fn test_threshold_from_variable() {
        let evaluator = setup(&[(1, Value::Float(42.0)), (2, Value::Float(40.0))]).await;
        let r = rule(SingleCondition::new(1, Operator::Gt, 0.0).with_threshold_variable(2).into());
        assert_eq!(evaluator.evaluate_rule(&r).await.unwrap(), RuleOutcome::Triggered);

        set(&evaluator, 2, 50.0).await;
        assert_eq!(evaluator.evaluate_rule(&r).await.unwrap(), RuleOutcome::NotTriggered);
    }

    #[tokio::test]
    async fn test_deadband_sequence_through_store() {
        let evaluator = setup(&[]).await;
        let r = rule(SingleCondition::new(1, Operator::Gte, 80.0).with_deadband(2.0).into());

        let mut outcomes = Vec::new();
        for v in [79.0, 79.0, 82.0, 77.0] {
            set(&evaluator, 1, v).await;
            outcomes.push(evaluator.evaluate_rule(&r).await.unwrap().is_triggered());
        }
        assert_eq!(outcomes, vec![false, false, true, false]);
        assert!(!evaluator.condition_state(1).unwrap().in_deadband);
    }

    #[tokio::test]
    async fn test_rising_edge_through_store() {
        let evaluator = setup(&[]).await;
        let r = rule(SingleCondition::edge(1, Operator::RisingEdge).into());

        let mut outcomes = Vec::new();
        for v in [true, true, false, true] {
            set(&evaluator, 1, v).await;
            outcomes.push(evaluator.evaluate_rule(&r).await.unwrap().is_triggered());
        }
        assert_eq!(outcomes, vec![false, false, false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_pending_then_triggered() {
        let evaluator = setup(&[(1, Value::Float(100.0))]).await;
        let r = rule(SingleCondition::new(1, Operator::Gt, 50.0).with_delay_ms(1000).into());

        assert_eq!(evaluator.evaluate_rule(&r).await.unwrap(), RuleOutcome::Pending);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(evaluator.evaluate_rule(&r).await.unwrap(), RuleOutcome::Pending);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(evaluator.evaluate_rule(&r).await.unwrap(), RuleOutcome::Triggered);

        // Loss of satisfaction disarms; the next satisfied pass starts over
        set(&evaluator, 1, 10.0).await;
        assert_eq!(evaluator.evaluate_rule(&r).await.unwrap(), RuleOutcome::NotTriggered);
        set(&evaluator, 1, 100.0).await;
        assert_eq!(evaluator.evaluate_rule(&r).await.unwrap(), RuleOutcome::Pending);
    }
}
