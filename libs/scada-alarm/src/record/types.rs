//! Alarm record types

use chrono::{DateTime, Utc};
use scada_model::{AlarmLevel, AlarmState, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordEventType {
    Trigger,
    Recover,
    Shielded,
}

impl RecordEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordEventType::Trigger => "trigger",
            RecordEventType::Recover => "recover",
            RecordEventType::Shielded => "shielded",
        }
    }
}

impl fmt::Display for RecordEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted alarm event, immutable once created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmRecord {
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub event_type: RecordEventType,
    pub level: AlarmLevel,
    pub state: AlarmState,
    #[serde(default)]
    pub category: String,
    pub trigger_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recover_time: Option<DateTime<Utc>>,
    /// Seconds from trigger to recovery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub threshold: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_value: Option<Value>,
    #[serde(default)]
    pub responsible_users: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_user: Option<String>,
    #[serde(default)]
    pub cloud_reported: bool,
    /// File holding the record, set by file-backed storage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    TriggerTime,
    CreatedAt,
    Level,
    RuleId,
}

/// Record filter with pagination; empty lists match everything
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordQuery {
    pub rule_ids: Vec<String>,
    pub levels: Vec<AlarmLevel>,
    pub categories: Vec<String>,
    pub states: Vec<AlarmState>,
    pub event_types: Vec<RecordEventType>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
    pub sort_by: SortField,
    pub sort_desc: bool,
}

impl Default for RecordQuery {
    fn default() -> Self {
        Self {
            rule_ids: Vec::new(),
            levels: Vec::new(),
            categories: Vec::new(),
            states: Vec::new(),
            event_types: Vec::new(),
            start_time: None,
            end_time: None,
            limit: 100,
            offset: 0,
            sort_by: SortField::TriggerTime,
            sort_desc: true,
        }
    }
}

impl RecordQuery {
    pub fn for_rule(rule_id: impl Into<String>) -> Self {
        Self {
            rule_ids: vec![rule_id.into()],
            ..Self::default()
        }
    }

    /// No pagination limit
    pub fn unlimited(mut self) -> Self {
        self.limit = usize::MAX;
        self
    }

    pub fn matches(&self, record: &AlarmRecord) -> bool {
        (self.rule_ids.is_empty() || self.rule_ids.contains(&record.rule_id))
            && (self.levels.is_empty() || self.levels.contains(&record.level))
            && (self.categories.is_empty() || self.categories.contains(&record.category))
            && (self.states.is_empty() || self.states.contains(&record.state))
            && (self.event_types.is_empty() || self.event_types.contains(&record.event_type))
            && self.start_time.map_or(true, |t| record.trigger_time >= t)
            && self.end_time.map_or(true, |t| record.trigger_time <= t)
    }

    /// Rule-ID-only lookups with a small page, answerable from the recent cache
    pub fn is_simple(&self) -> bool {
        !self.rule_ids.is_empty()
            && self.levels.is_empty()
            && self.categories.is_empty()
            && self.states.is_empty()
            && self.event_types.is_empty()
            && self.start_time.is_none()
            && self.end_time.is_none()
            && self.offset == 0
            && self.limit <= 100
            && self.sort_by == SortField::TriggerTime
            && self.sort_desc
    }

    /// Sort, then cut a page out of `records`
    pub fn paginate(&self, mut records: Vec<AlarmRecord>) -> QueryResult {
        sort_records(&mut records, self.sort_by, self.sort_desc);
        let total = records.len();
        let page: Vec<AlarmRecord> = records
            .into_iter()
            .skip(self.offset)
            .take(self.limit)
            .collect();
        let has_more = self.offset + page.len() < total;
        QueryResult {
            records: page,
            total,
            offset: self.offset,
            limit: self.limit,
            has_more,
        }
    }
}

pub fn sort_records(records: &mut [AlarmRecord], field: SortField, desc: bool) {
    records.sort_by(|a, b| {
        let ord = match field {
            SortField::TriggerTime => a.trigger_time.cmp(&b.trigger_time),
            SortField::CreatedAt => a.created_at.cmp(&b.created_at),
            SortField::Level => a.level.cmp(&b.level),
            SortField::RuleId => a.rule_id.cmp(&b.rule_id),
        }
        .then_with(|| a.id.cmp(&b.id));
        if desc {
            ord.reverse()
        } else {
            ord
        }
    });
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub records: Vec<AlarmRecord>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub has_more: bool,
}

/// Aggregate record counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecordStats {
    pub total: usize,
    pub trigger_count: usize,
    pub recover_count: usize,
    pub shielded_count: usize,
    pub by_level: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
    pub by_rule: BTreeMap<String, usize>,
    pub first_record_time: Option<DateTime<Utc>>,
    pub last_record_time: Option<DateTime<Utc>>,
}

impl RecordStats {
    pub fn add(&mut self, record: &AlarmRecord) {
        self.total += 1;
        match record.event_type {
            RecordEventType::Trigger => self.trigger_count += 1,
            RecordEventType::Recover => self.recover_count += 1,
            RecordEventType::Shielded => self.shielded_count += 1,
        }
        *self.by_level.entry(record.level.to_string()).or_default() += 1;
        *self.by_category.entry(record.category.clone()).or_default() += 1;
        *self.by_rule.entry(record.rule_id.clone()).or_default() += 1;
        let t = record.trigger_time;
        self.first_record_time = Some(self.first_record_time.map_or(t, |f| f.min(t)));
        self.last_record_time = Some(self.last_record_time.map_or(t, |l| l.max(t)));
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportOptions {
    pub format: ExportFormat,
    pub query: RecordQuery,
    /// CSV header row
    pub include_header: bool,
    /// File name without extension; generated when absent
    pub file_name: Option<String>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            format: ExportFormat::Json,
            query: RecordQuery::default().unlimited(),
            include_header: true,
            file_name: None,
        }
    }
}
