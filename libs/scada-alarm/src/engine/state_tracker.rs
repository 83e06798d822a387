//! Per-variable condition memory shared by the deadband and edge filters

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use scada_model::Value;
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConditionState {
    pub last_value: Option<Value>,
    /// Last filtered comparison result
    pub last_satisfied: bool,
    pub last_update: Option<DateTime<Utc>>,
    pub in_deadband: bool,
    /// Previous boolean observation (edge detection)
    pub last_bool: Option<bool>,
}

#[derive(Debug, Default)]
pub struct StateTracker {
    states: RwLock<FxHashMap<u64, ConditionState>>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, variable_id: u64) -> Option<ConditionState> {
        self.states.read().get(&variable_id).cloned()
    }

    /// Satisfied flag from the previous comparison, false when unseen
    pub fn last_satisfied(&self, variable_id: u64) -> bool {
        self.states
            .read()
            .get(&variable_id)
            .map(|s| s.last_satisfied)
            .unwrap_or(false)
    }

    /// Store a comparison result
    pub fn record_comparison(&self, variable_id: u64, value: Value, satisfied: bool, in_deadband: bool) {
        let mut states = self.states.write();
        let state = states.entry(variable_id).or_default();
        state.last_value = Some(value);
        state.last_satisfied = satisfied;
        state.in_deadband = in_deadband;
        state.last_update = Some(Utc::now());
    }

    /// Swap in a new boolean observation, returning the previous one
    pub fn replace_bool(&self, variable_id: u64, value: bool) -> Option<bool> {
        let mut states = self.states.write();
        let state = states.entry(variable_id).or_default();
        state.last_value = Some(Value::Bool(value));
        state.last_update = Some(Utc::now());
        state.last_bool.replace(value)
    }

    pub fn remove(&self, variable_id: u64) {
        self.states.write().remove(&variable_id);
    }

    pub fn clear(&self) {
        self.states.write().clear();
    }

    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }
}
