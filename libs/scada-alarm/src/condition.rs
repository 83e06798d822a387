//! Alarm condition tree
//!
//! A condition is either a single comparison against one variable or an
//! AND/OR group of child conditions, nested to any depth.
//!
//! ```yaml
//! type: group
//! logic: and
//! conditions:
//!   - type: single
//!     variable_id: 100001
//!     operator: ">="
//!     threshold: { type: static, value: 80 }
//!     deadband: 2.0
//!   - type: single
//!     variable_id: 100002
//!     operator: rising_edge
//! ```

use rustc_hash::FxHashSet;
use scada_model::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AlarmError, Result};

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "rising_edge")]
    RisingEdge,
    #[serde(rename = "falling_edge")]
    FallingEdge,
}

impl Operator {
    pub fn is_edge(&self) -> bool {
        matches!(self, Operator::RisingEdge | Operator::FallingEdge)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Gte => ">=",
            Operator::Lte => "<=",
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::RisingEdge => "rising_edge",
            Operator::FallingEdge => "falling_edge",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Right-hand side of a comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Threshold {
    Static { value: Value },
    /// Current value of another variable
    Variable { variable_id: u64 },
}

impl Threshold {
    pub fn fixed(value: impl Into<Value>) -> Self {
        Threshold::Static {
            value: value.into(),
        }
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Threshold::Static { value } => write!(f, "{}", value),
            Threshold::Variable { variable_id } => write!(f, "var:{}", variable_id),
        }
    }
}

/// One comparison against a single variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleCondition {
    pub variable_id: u64,
    pub operator: Operator,
    /// Unused by edge operators
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<Threshold>,
    #[serde(default)]
    pub deadband: f64,
    /// Sustained-satisfaction delay before triggering
    #[serde(default)]
    pub delay_ms: u64,
}

impl SingleCondition {
    pub fn new(variable_id: u64, operator: Operator, threshold: impl Into<Value>) -> Self {
        Self {
            variable_id,
            operator,
            threshold: Some(Threshold::fixed(threshold)),
            deadband: 0.0,
            delay_ms: 0,
        }
    }

    pub fn edge(variable_id: u64, operator: Operator) -> Self {
        Self {
            variable_id,
            operator,
            threshold: None,
            deadband: 0.0,
            delay_ms: 0,
        }
    }

    pub fn with_deadband(mut self, deadband: f64) -> Self {
        self.deadband = deadband;
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_threshold_variable(mut self, variable_id: u64) -> Self {
        self.threshold = Some(Threshold::Variable { variable_id });
        self
    }

    fn validate(&self) -> Result<()> {
        if self.variable_id == 0 {
            return Err(AlarmError::InvalidCondition(
                "variable_id must not be 0".to_string(),
            ));
        }
        if !self.deadband.is_finite() || self.deadband < 0.0 {
            return Err(AlarmError::InvalidCondition(format!(
                "deadband must be a non-negative number, got {}",
                self.deadband
            )));
        }
        if !self.operator.is_edge() && self.threshold.is_none() {
            return Err(AlarmError::InvalidCondition(format!(
                "operator {} on variable {} requires a threshold",
                self.operator, self.variable_id
            )));
        }
        Ok(())
    }
}

impl fmt::Display for SingleCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.threshold {
            Some(t) if !self.operator.is_edge() => {
                write!(f, "var:{} {} {}", self.variable_id, self.operator, t)
            },
            _ => write!(f, "var:{} {}", self.variable_id, self.operator),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Logic {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    pub logic: Logic,
    pub conditions: Vec<Condition>,
}

/// Condition tree node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Single(SingleCondition),
    Group(ConditionGroup),
}

impl Condition {
    pub fn and(conditions: Vec<Condition>) -> Self {
        Condition::Group(ConditionGroup {
            logic: Logic::And,
            conditions,
        })
    }

    pub fn or(conditions: Vec<Condition>) -> Self {
        Condition::Group(ConditionGroup {
            logic: Logic::Or,
            conditions,
        })
    }

    /// Recursive structural check
    pub fn validate(&self) -> Result<()> {
        match self {
            Condition::Single(single) => single.validate(),
            Condition::Group(group) => {
                if group.conditions.is_empty() {
                    return Err(AlarmError::EmptyGroup);
                }
                group.conditions.iter().try_for_each(Condition::validate)
            },
        }
    }

    /// Every variable referenced, including threshold references
    pub fn variable_ids(&self) -> FxHashSet<u64> {
        let mut ids = FxHashSet::default();
        self.collect_variable_ids(&mut ids);
        ids
    }

    fn collect_variable_ids(&self, ids: &mut FxHashSet<u64>) {
        match self {
            Condition::Single(single) => {
                ids.insert(single.variable_id);
                if let Some(Threshold::Variable { variable_id }) = &single.threshold {
                    ids.insert(*variable_id);
                }
            },
            Condition::Group(group) => {
                for child in &group.conditions {
                    child.collect_variable_ids(ids);
                }
            },
        }
    }

    /// Delay of a top-level single condition (groups never delay)
    pub fn delay_ms(&self) -> u64 {
        match self {
            Condition::Single(single) => single.delay_ms,
            Condition::Group(_) => 0,
        }
    }
}

impl From<SingleCondition> for Condition {
    fn from(single: SingleCondition) -> Self {
        Condition::Single(single)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Single(single) => write!(f, "{}", single),
            Condition::Group(group) => {
                let sep = match group.logic {
                    Logic::And => " AND ",
                    Logic::Or => " OR ",
                };
                let parts: Vec<String> = group.conditions.iter().map(|c| c.to_string()).collect();
                write!(f, "({})", parts.join(sep))
            },
        }
    }
}
