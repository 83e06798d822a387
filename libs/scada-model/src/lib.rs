//! SCADA Model Library
//!
//! Shared data model for the variable store and the alarm engine.
//!
//! # Modules
//!
//! - `types`: variables, values, quality codes, alarm level/state enums
//! - `variable_id`: numeric ID ranges, `IdGenerator`, string ID parsing
//! - `error`: model errors

pub mod error;
pub mod types;
pub mod variable_id;

pub use error::{ModelError, Result};
pub use types::{
    AlarmLevel, AlarmState, DataType, QualityCode, Value, Variable, VariableUpdate, FLOAT_EPSILON,
};
pub use variable_id::{
    fnv1a_64, is_valid_id, validate_string_id, IdGenerator, IdKind, StringId, CUSTOM_ID_RANGE,
    SYSTEM_ID_RANGE,
};
