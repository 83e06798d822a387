//! Alarm rule definitions

use rustc_hash::FxHashSet;
use scada_model::AlarmLevel;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::condition::Condition;
use crate::error::{AlarmError, Result};

/// Action descriptor handed to the action executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// e.g. `notify`, `write_variable`, `webhook`
    pub action_type: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

impl Action {
    pub fn new(action_type: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            target: target.into(),
            params: HashMap::new(),
        }
    }
}

/// AlarmRule - one monitored condition with its severity and responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmRule {
    /// Unique identifier
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub category: String,

    #[serde(default)]
    pub level: AlarmLevel,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Evaluation is shielded while this condition is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_condition: Option<Condition>,

    pub condition: Condition,

    #[serde(default)]
    pub trigger_actions: Vec<Action>,

    #[serde(default)]
    pub recover_actions: Vec<Action>,

    #[serde(default)]
    pub responsible_users: Vec<String>,

    /// Message template, `{var:ID}` placeholders are substituted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl AlarmRule {
    pub fn new(id: impl Into<String>, name: impl Into<String>, condition: Condition) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            category: String::new(),
            level: AlarmLevel::default(),
            enabled: true,
            enable_condition: None,
            condition,
            trigger_actions: Vec::new(),
            recover_actions: Vec::new(),
            responsible_users: Vec::new(),
            message: None,
        }
    }

    pub fn with_level(mut self, level: AlarmLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_enable_condition(mut self, condition: Condition) -> Self {
        self.enable_condition = Some(condition);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(AlarmError::InvalidRule("rule ID is empty".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(AlarmError::InvalidRule(format!("rule {} has no name", self.id)));
        }
        self.condition
            .validate()
            .map_err(|e| AlarmError::InvalidRule(format!("rule {}: {}", self.id, e)))?;
        if let Some(enable) = &self.enable_condition {
            enable.validate().map_err(|e| {
                AlarmError::InvalidRule(format!("rule {} enable condition: {}", self.id, e))
            })?;
        }
        Ok(())
    }

    /// Variables read by the primary and enabling conditions
    pub fn variable_ids(&self) -> FxHashSet<u64> {
        let mut ids = self.condition.variable_ids();
        if let Some(enable) = &self.enable_condition {
            ids.extend(enable.variable_ids());
        }
        ids
    }
}
