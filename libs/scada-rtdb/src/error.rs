//! Error types for scada-rtdb

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RtdbError {
    #[error("Variable not found: {0}")]
    NotFound(u64),

    #[error("Variable not found by string ID: {0}")]
    NotFoundByName(String),

    #[error("Variable already exists: {0}")]
    AlreadyExists(u64),

    /// String ID already bound to a different numeric ID
    #[error("String ID {string_id} already bound to variable {existing}")]
    DuplicateStringId { string_id: String, existing: u64 },

    #[error("Invalid variable: {0}")]
    InvalidVariable(String),

    #[error("Batch write failed for {failed} variable(s): {first_error}")]
    Batch { failed: usize, first_error: String },

    #[error("Storage is stopped")]
    Stopped,

    #[error(transparent)]
    Model(#[from] scada_model::ModelError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RtdbError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RtdbError::NotFound(_) | RtdbError::NotFoundByName(_))
    }
}

pub type Result<T> = std::result::Result<T, RtdbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error() {
        let err = RtdbError::NotFound(100_001);
        assert_eq!(err.to_string(), "Variable not found: 100001");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_duplicate_string_id_error() {
        let err = RtdbError::DuplicateStringId {
            string_id: "DV-PLC001-TEMP".to_string(),
            existing: 7,
        };
        assert_eq!(
            err.to_string(),
            "String ID DV-PLC001-TEMP already bound to variable 7"
        );
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_batch_error() {
        let err = RtdbError::Batch {
            failed: 2,
            first_error: "Invalid variable: id 0".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Batch write failed for 2 variable(s): Invalid variable: id 0"
        );
    }
}
