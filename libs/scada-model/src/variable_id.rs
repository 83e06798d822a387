//! Variable identifier spaces
//!
//! Numeric IDs are split into a system range and a custom range. String IDs
//! follow `TYPE-DEVICE-VAR[-INDEX]`, e.g. `DV-PLC001-TEMP01-2`.

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::fmt;
use std::ops::RangeInclusive;

use crate::error::{ModelError, Result};

/// Reserved for built-in system variables
pub const SYSTEM_ID_RANGE: RangeInclusive<u64> = 1..=99_999;

/// User/device variables
pub const CUSTOM_ID_RANGE: RangeInclusive<u64> = 100_000..=999_999_999;

const FNV_OFFSET_BASIS: u64 = 14_695_981_039_346_656_037;
const FNV_PRIME: u64 = 1_099_511_628_211;

/// 64-bit FNV-1a hash, used to place string IDs onto shards
pub fn fnv1a_64(s: &str) -> u64 {
    s.as_bytes().iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Which ID range a numeric ID falls into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    System,
    Custom,
    Unknown,
}

impl IdKind {
    pub fn of(id: u64) -> Self {
        if SYSTEM_ID_RANGE.contains(&id) {
            IdKind::System
        } else if CUSTOM_ID_RANGE.contains(&id) {
            IdKind::Custom
        } else {
            IdKind::Unknown
        }
    }
}

pub fn is_valid_id(id: u64) -> bool {
    !matches!(IdKind::of(id), IdKind::Unknown)
}

struct GeneratorState {
    last_system: u64,
    last_custom: u64,
    used: FxHashSet<u64>,
}

/// First unused ID after `cursor`, wrapping to the start of the range
fn first_free(used: &FxHashSet<u64>, range: &RangeInclusive<u64>, cursor: u64) -> Option<u64> {
    let (start, end) = (*range.start(), *range.end());
    let from = cursor.saturating_add(1).max(start);
    (from..=end).chain(start..from).find(|id| !used.contains(id))
}

/// Sequential allocator for both ID ranges, skipping IDs already in use
pub struct IdGenerator {
    state: Mutex<GeneratorState>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GeneratorState {
                last_system: SYSTEM_ID_RANGE.start() - 1,
                last_custom: CUSTOM_ID_RANGE.start() - 1,
                used: FxHashSet::default(),
            }),
        }
    }

    pub fn next_system_id(&self) -> Result<u64> {
        let mut state = self.state.lock();
        let id = first_free(&state.used, &SYSTEM_ID_RANGE, state.last_system)
            .ok_or(ModelError::IdSpaceExhausted("system"))?;
        state.used.insert(id);
        state.last_system = id;
        Ok(id)
    }

    pub fn next_custom_id(&self) -> Result<u64> {
        let mut state = self.state.lock();
        let id = first_free(&state.used, &CUSTOM_ID_RANGE, state.last_custom)
            .ok_or(ModelError::IdSpaceExhausted("custom"))?;
        state.used.insert(id);
        state.last_custom = id;
        Ok(id)
    }

    /// Reserve an externally chosen ID
    pub fn mark_used(&self, id: u64) {
        let mut state = self.state.lock();
        state.used.insert(id);
        match IdKind::of(id) {
            IdKind::System if id > state.last_system => state.last_system = id,
            IdKind::Custom if id > state.last_custom => state.last_custom = id,
            _ => {},
        }
    }

    pub fn release(&self, id: u64) {
        self.state.lock().used.remove(&id);
    }

    pub fn is_used(&self, id: u64) -> bool {
        self.state.lock().used.contains(&id)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Parsed components of a string ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringId {
    /// Variable class: `SV` system, `DV` device, `CV` calculated
    pub kind: String,
    pub device_id: String,
    pub variable: String,
    pub index: Option<u32>,
}

impl StringId {
    pub fn new(kind: impl Into<String>, device_id: impl Into<String>, variable: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            device_id: device_id.into(),
            variable: variable.into(),
            index: None,
        }
    }

    pub fn with_index(mut self, index: u32) -> Self {
        self.index = Some(index);
        self
    }

    /// Parse `TYPE-DEVICE-VAR[-INDEX]`
    ///
    /// A trailing numeric segment is the index; any other extra segments
    /// belong to the variable part.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() < 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(ModelError::InvalidStringId(s.to_string()));
        }

        let (variable_parts, index) = match parts.len() {
            3 => (&parts[2..], None),
            _ => match parts[parts.len() - 1].parse::<u32>() {
                Ok(idx) => (&parts[2..parts.len() - 1], Some(idx)),
                Err(_) => (&parts[2..], None),
            },
        };

        Ok(Self {
            kind: parts[0].to_string(),
            device_id: parts[1].to_string(),
            variable: variable_parts.join("-"),
            index,
        })
    }
}

impl fmt::Display for StringId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.kind, self.device_id, self.variable)?;
        if let Some(index) = self.index {
            write!(f, "-{}", index)?;
        }
        Ok(())
    }
}

pub fn validate_string_id(s: &str) -> Result<()> {
    StringId::parse(s).map(|_| ())
}
