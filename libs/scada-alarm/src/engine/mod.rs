//! Evaluation engine: condition evaluator, filters and state machine

pub mod deadband;
pub mod delay;
pub mod edge;
pub mod evaluator;
pub mod state_machine;
pub mod state_tracker;

pub use deadband::DeadbandFilter;
pub use delay::{DelayHandler, DelayStatus, DelayTracker};
pub use edge::EdgeDetector;
pub use evaluator::{ConditionEvaluator, RuleOutcome};
pub use state_machine::{AlarmStateMachine, StateMachineStats, StateTransition};
pub use state_tracker::{ConditionState, StateTracker};
