//! Boolean edge detection
//!
//! Rising fires on false→true only, falling on true→false only. The first
//! observation of a variable has no predecessor and never fires.

use std::sync::Arc;

use super::state_tracker::StateTracker;
use crate::condition::Operator;

pub struct EdgeDetector {
    states: Arc<StateTracker>,
}

impl EdgeDetector {
    pub fn new(states: Arc<StateTracker>) -> Self {
        Self { states }
    }

    /// Record `current` and report whether it forms the requested edge
    pub fn detect(&self, variable_id: u64, operator: Operator, current: bool) -> bool {
        let previous = self.states.replace_bool(variable_id, current);
        match (operator, previous) {
            (Operator::RisingEdge, Some(false)) => current,
            (Operator::FallingEdge, Some(true)) => !current,
            _ => false,
        }
    }
}
