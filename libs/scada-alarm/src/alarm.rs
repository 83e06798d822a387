//! Runtime alarm instance

use chrono::{DateTime, Utc};
use scada_model::{AlarmLevel, AlarmState, Value};
use serde::{Deserialize, Serialize};

use crate::rule::AlarmRule;

/// Live instance of a raised (or most recently raised) alarm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveAlarm {
    pub rule_id: String,
    pub rule_name: String,
    pub level: AlarmLevel,
    pub category: String,
    pub state: AlarmState,
    pub trigger_time: DateTime<Utc>,
    /// Value of the primary variable at trigger time
    pub trigger_value: Option<Value>,
    pub message: String,
    pub ack_user: Option<String>,
    pub ack_time: Option<DateTime<Utc>>,
    pub recover_time: Option<DateTime<Utc>>,
}

impl ActiveAlarm {
    pub fn new(rule: &AlarmRule, trigger_value: Option<Value>, message: String) -> Self {
        Self {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            level: rule.level,
            category: rule.category.clone(),
            state: AlarmState::Active,
            trigger_time: Utc::now(),
            trigger_value,
            message,
            ack_user: None,
            ack_time: None,
            recover_time: None,
        }
    }

    /// Seconds between trigger and recovery (or now when unrecovered)
    pub fn duration_secs(&self) -> f64 {
        let end = self.recover_time.unwrap_or_else(Utc::now);
        (end - self.trigger_time).num_milliseconds() as f64 / 1000.0
    }
}
