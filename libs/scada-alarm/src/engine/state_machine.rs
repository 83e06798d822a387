//! Alarm State Machine
//!
//! ```text
//! Inactive ──▶ Active ──▶ Acknowledged ──▶ Cleared
//!                 │                           ▲  │
//!                 └───────────────────────────┘  │
//!                 ▲                              │
//!                 └──────── re-trigger ──────────┘
//! ```
//!
//! The authoritative per-rule alarm state. Every accepted transition is
//! appended to the rule's history, which keeps the latest
//! [`HISTORY_LIMIT`] entries.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use scada_model::AlarmState;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

use crate::error::{AlarmError, Result};

/// Transitions retained per rule
pub const HISTORY_LIMIT: usize = 100;

/// One accepted transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    pub from: AlarmState,
    pub to: AlarmState,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Legal targets from a state
pub fn allowed_transitions(from: AlarmState) -> &'static [AlarmState] {
    match from {
        AlarmState::Inactive => &[AlarmState::Active],
        AlarmState::Active => &[AlarmState::Acknowledged, AlarmState::Cleared],
        AlarmState::Acknowledged => &[AlarmState::Cleared],
        AlarmState::Cleared => &[AlarmState::Active],
    }
}

pub fn can_transition(from: AlarmState, to: AlarmState) -> bool {
    allowed_transitions(from).contains(&to)
}

#[derive(Debug, Default)]
struct RuleStateEntry {
    state: AlarmState,
    history: VecDeque<StateTransition>,
    transitions: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StateMachineStats {
    pub total: usize,
    pub by_state: BTreeMap<String, usize>,
    pub transitions: usize,
}

#[derive(Debug, Default)]
pub struct AlarmStateMachine {
    entries: RwLock<FxHashMap<String, RuleStateEntry>>,
}

impl AlarmStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state, Inactive for unknown rules
    pub fn get_state(&self, rule_id: &str) -> AlarmState {
        self.entries
            .read()
            .get(rule_id)
            .map(|e| e.state)
            .unwrap_or_default()
    }

    pub fn is_active(&self, rule_id: &str) -> bool {
        self.get_state(rule_id).is_raised()
    }

    /// Validated transition; returns the accepted record
    pub fn transition(
        &self,
        rule_id: &str,
        to: AlarmState,
        reason: &str,
        user: Option<&str>,
    ) -> Result<StateTransition> {
        let mut entries = self.entries.write();
        let from = entries.get(rule_id).map(|e| e.state).unwrap_or_default();
        if !can_transition(from, to) {
            return Err(AlarmError::IllegalTransition { from, to });
        }
        let entry = entries.entry(rule_id.to_string()).or_default();
        Ok(Self::apply(entry, rule_id, to, reason, user))
    }

    /// Unvalidated transition for restoring state; still recorded
    pub fn force_transition(&self, rule_id: &str, to: AlarmState, user: Option<&str>) -> StateTransition {
        let mut entries = self.entries.write();
        let entry = entries.entry(rule_id.to_string()).or_default();
        Self::apply(entry, rule_id, to, "force", user)
    }

    fn apply(
        entry: &mut RuleStateEntry,
        rule_id: &str,
        to: AlarmState,
        reason: &str,
        user: Option<&str>,
    ) -> StateTransition {
        let record = StateTransition {
            from: entry.state,
            to,
            timestamp: Utc::now(),
            reason: reason.to_string(),
            user: user.map(str::to_string),
        };
        debug!("Rule {}: {} -> {} ({})", rule_id, record.from, to, reason);
        entry.state = to;
        entry.transitions += 1;
        if entry.history.len() >= HISTORY_LIMIT {
            entry.history.pop_front();
        }
        entry.history.push_back(record.clone());
        record
    }

    pub fn get_transition_history(&self, rule_id: &str) -> Vec<StateTransition> {
        self.entries
            .read()
            .get(rule_id)
            .map(|e| e.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn last_transition(&self, rule_id: &str) -> Option<StateTransition> {
        self.entries
            .read()
            .get(rule_id)
            .and_then(|e| e.history.back().cloned())
    }

    /// Discard state and history for a rule
    pub fn clear(&self, rule_id: &str) {
        self.entries.write().remove(rule_id);
    }

    pub fn all_states(&self) -> BTreeMap<String, AlarmState> {
        self.entries
            .read()
            .iter()
            .map(|(id, e)| (id.clone(), e.state))
            .collect()
    }

    pub fn stats(&self) -> StateMachineStats {
        let entries = self.entries.read();
        let mut stats = StateMachineStats {
            total: entries.len(),
            ..StateMachineStats::default()
        };
        for entry in entries.values() {
            *stats.by_state.entry(entry.state.to_string()).or_default() += 1;
            stats.transitions += entry.transitions;
        }
        stats
    }
}
