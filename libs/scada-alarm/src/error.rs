//! Alarm Engine Error Types

use scada_model::AlarmState;
use thiserror::Error;

/// Result type for alarm operations
pub type Result<T> = std::result::Result<T, AlarmError>;

/// Alarm engine errors
#[derive(Debug, Error)]
pub enum AlarmError {
    /// Variable present but quality is not Good
    #[error("Variable {variable_id} has bad quality: {quality}")]
    BadQuality { variable_id: u64, quality: String },

    #[error("Illegal state transition: {from} -> {to}")]
    IllegalTransition { from: AlarmState, to: AlarmState },

    #[error("Condition group is empty")]
    EmptyGroup,

    #[error("Invalid condition: {0}")]
    InvalidCondition(String),

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    #[error("Rule already exists: {0}")]
    RuleAlreadyExists(String),

    /// Acknowledge attempted outside the Active state
    #[error("Alarm {rule_id} cannot be acknowledged in state {state}")]
    NotAcknowledgeable { rule_id: String, state: AlarmState },

    #[error("Type conversion error: {0}")]
    TypeConversion(String),

    /// Variable store failure (including NotFound)
    #[error("Storage error: {0}")]
    Storage(#[from] scada_rtdb::RtdbError),

    #[error("Record error: {0}")]
    Record(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Alarm consumer is not running")]
    NotRunning,

    #[error("Alarm consumer is already running")]
    AlreadyRunning,
}

impl From<scada_model::ModelError> for AlarmError {
    fn from(err: scada_model::ModelError) -> Self {
        AlarmError::TypeConversion(err.to_string())
    }
}

impl AlarmError {
    pub fn is_bad_quality(&self) -> bool {
        matches!(self, AlarmError::BadQuality { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AlarmError::IllegalTransition {
            from: AlarmState::Active,
            to: AlarmState::Inactive,
        };
        assert_eq!(err.to_string(), "Illegal state transition: active -> inactive");

        let err = AlarmError::BadQuality {
            variable_id: 100_001,
            quality: "bad".to_string(),
        };
        assert!(err.is_bad_quality());
        assert_eq!(err.to_string(), "Variable 100001 has bad quality: bad");
    }

    #[test]
    fn test_from_rtdb_error() {
        let err: AlarmError = scada_rtdb::RtdbError::NotFound(7).into();
        assert!(matches!(err, AlarmError::Storage(_)));
    }
}
