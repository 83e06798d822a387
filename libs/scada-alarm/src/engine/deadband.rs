//! Deadband (hysteresis) filtering
//!
//! The dead zone sits on the non-triggering side of the threshold, so it
//! only suppresses chatter on the way back out of the alarm:
//!
//! | operator | dead zone (t = threshold, d = deadband) |
//! |----------|------------------------------------------|
//! | `>=`     | `[t-d, t)`                               |
//! | `>`      | `[t-d, t]`                               |
//! | `<=`     | `(t, t+d]`                               |
//! | `<`      | `[t, t+d]`                               |
//! | `==`/`!=`| `[t-d, t+d]` minus the threshold point   |
//!
//! Inside the zone the previous result is kept; outside it the raw comparison
//! decides. Either way the per-variable memory is updated.

use scada_model::{Value, FLOAT_EPSILON};
use std::sync::Arc;

use super::state_tracker::StateTracker;
use crate::condition::Operator;

/// Raw comparison with epsilon equality
pub fn compare(operator: Operator, value: f64, threshold: f64) -> bool {
    match operator {
        Operator::Gt => value > threshold,
        Operator::Lt => value < threshold,
        Operator::Gte => value >= threshold,
        Operator::Lte => value <= threshold,
        Operator::Eq => (value - threshold).abs() <= FLOAT_EPSILON,
        Operator::Ne => (value - threshold).abs() > FLOAT_EPSILON,
        Operator::RisingEdge | Operator::FallingEdge => false,
    }
}

pub fn in_dead_zone(operator: Operator, value: f64, threshold: f64, deadband: f64) -> bool {
    if deadband <= 0.0 {
        return false;
    }
    match operator {
        Operator::Gte => value >= threshold - deadband && value < threshold,
        Operator::Gt => value >= threshold - deadband && value <= threshold,
        Operator::Lte => value > threshold && value <= threshold + deadband,
        Operator::Lt => value >= threshold && value <= threshold + deadband,
        Operator::Eq | Operator::Ne => {
            let distance = (value - threshold).abs();
            distance > FLOAT_EPSILON && distance <= deadband
        },
        Operator::RisingEdge | Operator::FallingEdge => false,
    }
}

pub struct DeadbandFilter {
    states: Arc<StateTracker>,
}

impl DeadbandFilter {
    pub fn new(states: Arc<StateTracker>) -> Self {
        Self { states }
    }

    /// Filtered comparison for one variable observation
    pub fn apply(
        &self,
        variable_id: u64,
        operator: Operator,
        value: f64,
        threshold: f64,
        deadband: f64,
    ) -> bool {
        let in_zone = in_dead_zone(operator, value, threshold, deadband);
        let satisfied = if in_zone {
            self.states.last_satisfied(variable_id)
        } else {
            compare(operator, value, threshold)
        };
        self.states
            .record_comparison(variable_id, Value::Float(value), satisfied, in_zone);
        satisfied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(operator: Operator, threshold: f64, deadband: f64, values: &[f64]) -> Vec<bool> {
        let filter = DeadbandFilter::new(Arc::new(StateTracker::new()));
        values
            .iter()
            .map(|v| filter.apply(1, operator, *v, threshold, deadband))
            .collect()
    }

    #[test]
    fn test_gte_sequence() {
        assert_eq!(
            run(Operator::Gte, 80.0, 2.0, &[79.0, 79.0, 82.0, 77.0]),
            vec![false, false, true, false]
        );
    }

    #[test]
    fn test_gte_holds_inside_zone() {
        // 79 stays active after 82, 77.9 clears
        assert_eq!(
            run(Operator::Gte, 80.0, 2.0, &[82.0, 79.0, 78.0, 77.9, 79.0]),
            vec![true, true, true, false, false]
        );
    }

    #[test]
    fn test_gt_threshold_point_is_dead() {
        assert_eq!(
            run(Operator::Gt, 80.0, 2.0, &[80.5, 80.0, 78.0, 77.0, 80.0]),
            vec![true, true, true, false, false]
        );
    }

    #[test]
    fn test_lte_and_lt_mirror() {
        assert_eq!(
            run(Operator::Lte, 10.0, 1.0, &[10.5, 9.0, 10.5, 11.5]),
            vec![false, true, true, false]
        );
        assert_eq!(
            run(Operator::Lt, 10.0, 1.0, &[9.5, 10.0, 11.0, 11.1]),
            vec![true, true, true, false]
        );
    }

    #[test]
    fn test_equality_symmetric_zone() {
        assert_eq!(
            run(Operator::Eq, 50.0, 0.5, &[50.0, 50.3, 49.6, 49.4, 50.2]),
            vec![true, true, true, false, false]
        );
        assert_eq!(
            run(Operator::Ne, 50.0, 0.5, &[51.0, 50.3, 50.0, 49.8]),
            vec![true, true, false, false]
        );
    }

    #[test]
    fn test_zero_deadband_is_raw() {
        assert_eq!(
            run(Operator::Gte, 80.0, 0.0, &[80.0, 79.999, 80.0]),
            vec![true, false, true]
        );
    }

    #[test]
    fn test_epsilon_equality() {
        assert!(compare(Operator::Eq, 0.1 + 0.2, 0.3));
        assert!(!compare(Operator::Ne, 0.1 + 0.2, 0.3));
    }
}
