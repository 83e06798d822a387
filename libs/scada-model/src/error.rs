//! Model layer errors

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    /// String ID does not follow `TYPE-DEVICE-VAR[-INDEX]`
    #[error("Invalid string ID: {0}")]
    InvalidStringId(String),

    #[error("ID {0} is outside the system and custom ranges")]
    IdOutOfRange(u64),

    #[error("{0} ID space exhausted")]
    IdSpaceExhausted(&'static str),

    #[error("Value conversion failed: {0}")]
    Conversion(String),
}
