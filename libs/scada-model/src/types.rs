//! Core domain types for the SCADA gateway
//!
//! Variables (tags), their values and quality codes, plus the alarm
//! severity/state enums shared by the store and the alarm engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ModelError, Result};

/// Tolerance used for float equality in alarm comparisons
pub const FLOAT_EPSILON: f64 = 1e-9;

// ============================================================================
// Data Types
// ============================================================================

/// Declared data type of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[default]
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    #[serde(rename = "uint8")]
    UInt8,
    #[serde(rename = "uint16")]
    UInt16,
    #[serde(rename = "uint32")]
    UInt32,
    #[serde(rename = "uint64")]
    UInt64,
    Float32,
    Float64,
    String,
    Bytes,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::UInt8 => "uint8",
            DataType::UInt16 => "uint16",
            DataType::UInt32 => "uint32",
            DataType::UInt64 => "uint64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::String => "string",
            DataType::Bytes => "bytes",
        }
    }

    /// True for every integer and float type
    pub fn is_numeric(&self) -> bool {
        !matches!(self, DataType::Bool | DataType::String | DataType::Bytes)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Quality Codes
// ============================================================================

/// Read reliability flag attached to every variable value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityCode {
    #[default]
    Good,
    Bad,
    Uncertain,
    Disconnected,
    Timeout,
    Overflow,
}

impl QualityCode {
    /// Numeric wire code (Good=0 ... Overflow=5)
    pub fn code(&self) -> u8 {
        match self {
            QualityCode::Good => 0,
            QualityCode::Bad => 1,
            QualityCode::Uncertain => 2,
            QualityCode::Disconnected => 3,
            QualityCode::Timeout => 4,
            QualityCode::Overflow => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(QualityCode::Good),
            1 => Some(QualityCode::Bad),
            2 => Some(QualityCode::Uncertain),
            3 => Some(QualityCode::Disconnected),
            4 => Some(QualityCode::Timeout),
            5 => Some(QualityCode::Overflow),
            _ => None,
        }
    }

    pub fn is_good(&self) -> bool {
        matches!(self, QualityCode::Good)
    }
}

impl fmt::Display for QualityCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QualityCode::Good => "good",
            QualityCode::Bad => "bad",
            QualityCode::Uncertain => "uncertain",
            QualityCode::Disconnected => "disconnected",
            QualityCode::Timeout => "timeout",
            QualityCode::Overflow => "overflow",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Values
// ============================================================================

/// Polymorphic variable value
///
/// Serialized untagged so YAML/JSON literals (`true`, `80`, `12.5`, `"on"`)
/// map directly onto the matching variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Float(0.0)
    }
}

impl Value {
    /// Convert to f64 for comparisons (bool true = 1.0)
    pub fn as_f64(&self) -> Result<f64> {
        match self {
            Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Ok(*i as f64),
            Value::UInt(u) => Ok(*u as f64),
            Value::Float(f) => Ok(*f),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| ModelError::Conversion(format!("'{}' is not numeric", s))),
            Value::Bytes(_) => Err(ModelError::Conversion(
                "bytes cannot be converted to a number".to_string(),
            )),
        }
    }

    /// Convert to bool for edge detection (numbers: non-zero = true)
    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Int(i) => Ok(*i != 0),
            Value::UInt(u) => Ok(*u != 0),
            Value::Float(f) => Ok(f.abs() > FLOAT_EPSILON),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "on" | "1" => Ok(true),
                "false" | "off" | "0" => Ok(false),
                other => Err(ModelError::Conversion(format!("'{}' is not boolean", other))),
            },
            Value::Bytes(_) => Err(ModelError::Conversion(
                "bytes cannot be converted to bool".to_string(),
            )),
        }
    }

    /// Natural data type of this value
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Bool(_) => DataType::Bool,
            Value::Int(_) => DataType::Int64,
            Value::UInt(_) => DataType::UInt64,
            Value::Float(_) => DataType::Float64,
            Value::String(_) => DataType::String,
            Value::Bytes(_) => DataType::Bytes,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::UInt(u) => write!(f, "{}", u),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => f.write_str(s),
            Value::Bytes(b) => write!(f, "{:02x?}", b),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

// ============================================================================
// Variables
// ============================================================================

/// A device data point held by the variable store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    /// Dense numeric identifier (shard key)
    pub id: u64,
    /// Human readable identifier, e.g. `DV-PLC001-VAR000000`
    pub string_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub quality: QualityCode,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl Variable {
    /// New variable with Good quality stamped now
    pub fn new(id: u64, string_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            id,
            string_id: string_id.into(),
            name: String::new(),
            description: String::new(),
            data_type: DataType::default(),
            value: Value::default(),
            quality: QualityCode::Good,
            timestamp: Utc::now(),
            device_id: device_id.into(),
            unit: String::new(),
            min: None,
            max: None,
        }
    }

    /// Builder-style value setter that also aligns the data type
    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.value = value.into();
        self.data_type = self.value.data_type();
        self
    }

    pub fn with_quality(mut self, quality: QualityCode) -> Self {
        self.quality = quality;
        self
    }

    /// Update value/quality/timestamp in place (identity fields untouched)
    pub fn set_value(&mut self, value: Value, quality: QualityCode, timestamp: DateTime<Utc>) {
        self.value = value;
        self.quality = quality;
        self.timestamp = timestamp;
    }

    /// Snapshot of the current value as an update event
    pub fn to_update(&self) -> VariableUpdate {
        VariableUpdate {
            variable_id: self.id,
            value: self.value.clone(),
            quality: self.quality,
            timestamp: self.timestamp,
        }
    }
}

/// Immutable update event emitted once per successful write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableUpdate {
    pub variable_id: u64,
    pub value: Value,
    pub quality: QualityCode,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Alarm Enums
// ============================================================================

/// Alarm severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl AlarmLevel {
    /// Numeric level (Low=1 ... Critical=4)
    pub fn value(&self) -> u8 {
        match self {
            AlarmLevel::Low => 1,
            AlarmLevel::Medium => 2,
            AlarmLevel::High => 3,
            AlarmLevel::Critical => 4,
        }
    }

    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            1 => Some(AlarmLevel::Low),
            2 => Some(AlarmLevel::Medium),
            3 => Some(AlarmLevel::High),
            4 => Some(AlarmLevel::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmLevel::Low => "low",
            AlarmLevel::Medium => "medium",
            AlarmLevel::High => "high",
            AlarmLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for AlarmLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-rule alarm lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmState {
    #[default]
    Inactive,
    Active,
    Acknowledged,
    Cleared,
}

impl AlarmState {
    /// Numeric state (Inactive=0 ... Cleared=3)
    pub fn value(&self) -> u8 {
        match self {
            AlarmState::Inactive => 0,
            AlarmState::Active => 1,
            AlarmState::Acknowledged => 2,
            AlarmState::Cleared => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmState::Inactive => "inactive",
            AlarmState::Active => "active",
            AlarmState::Acknowledged => "acknowledged",
            AlarmState::Cleared => "cleared",
        }
    }

    /// Active or Acknowledged
    pub fn is_raised(&self) -> bool {
        matches!(self, AlarmState::Active | AlarmState::Acknowledged)
    }
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_value_numeric_conversion() {
        assert_eq!(Value::Bool(true).as_f64().unwrap(), 1.0);
        assert_eq!(Value::Bool(false).as_f64().unwrap(), 0.0);
        assert_eq!(Value::Int(-3).as_f64().unwrap(), -3.0);
        assert_eq!(Value::UInt(7).as_f64().unwrap(), 7.0);
        assert_eq!(Value::from(" 12.5 ").as_f64().unwrap(), 12.5);
        assert!(Value::from("abc").as_f64().is_err());
        assert!(Value::Bytes(vec![1, 2]).as_f64().is_err());
    }

    #[test]
    fn test_value_bool_conversion() {
        assert!(Value::Int(5).as_bool().unwrap());
        assert!(!Value::Float(0.0).as_bool().unwrap());
        assert!(Value::from("ON").as_bool().unwrap());
        assert!(Value::from("maybe").as_bool().is_err());
    }

    #[test]
    fn test_value_untagged_yaml() {
        let values: Vec<Value> = serde_yaml::from_str("[true, 80, 12.5, \"run\"]").unwrap();
        assert_eq!(
            values,
            vec![
                Value::Bool(true),
                Value::Int(80),
                Value::Float(12.5),
                Value::String("run".to_string())
            ]
        );
    }

    #[test]
    fn test_quality_codes() {
        for code in 0..=5u8 {
            let quality = QualityCode::from_code(code).unwrap();
            assert_eq!(quality.code(), code);
        }
        assert!(QualityCode::from_code(6).is_none());
        assert!(QualityCode::Good.is_good());
        assert!(!QualityCode::Timeout.is_good());
    }

    #[test]
    fn test_alarm_level_ordering() {
        assert!(AlarmLevel::Critical > AlarmLevel::High);
        assert_eq!(AlarmLevel::from_value(3), Some(AlarmLevel::High));
        assert_eq!(AlarmLevel::Medium.value(), 2);
    }

    #[test]
    fn test_variable_update_snapshot() {
        let var = Variable::new(100_001, "DV-PLC001-TEMP", "PLC001").with_value(42.0);
        let update = var.to_update();
        assert_eq!(update.variable_id, 100_001);
        assert_eq!(update.value, Value::Float(42.0));
        assert_eq!(var.data_type, DataType::Float64);
    }
}
