//! Alarm Service Library
//!
//! Wires the realtime variable store, rule set and alarm consumer into one
//! process. Variable values arrive from external collectors through
//! `AlarmService::storage()`.

pub mod config;
pub mod loader;
pub mod service;

pub use config::AlarmsrvConfig;
pub use loader::{load_rules, load_variables, VariableSeed};
pub use service::AlarmService;
