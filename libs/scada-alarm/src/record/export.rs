//! JSON / CSV export of alarm records

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use std::io::Read;

use super::types::{AlarmRecord, ExportFormat};
use crate::error::{AlarmError, Result};

/// CSV row layout (column names are the header row)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsvRow {
    #[serde(rename = "Record ID")]
    pub record_id: String,
    #[serde(rename = "Rule ID")]
    pub rule_id: String,
    #[serde(rename = "Rule Name")]
    pub rule_name: String,
    #[serde(rename = "Event Type")]
    pub event_type: String,
    #[serde(rename = "Level")]
    pub level: String,
    #[serde(rename = "State")]
    pub state: String,
    #[serde(rename = "Category")]
    pub category: String,
    #[serde(rename = "Trigger Time")]
    pub trigger_time: String,
    #[serde(rename = "Recover Time")]
    pub recover_time: String,
    #[serde(rename = "Duration (s)")]
    pub duration_secs: String,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Threshold")]
    pub threshold: String,
    #[serde(rename = "Trigger Value")]
    pub trigger_value: String,
    #[serde(rename = "Responsible Users")]
    pub responsible_users: String,
    #[serde(rename = "Ack User")]
    pub ack_user: String,
}

impl From<&AlarmRecord> for CsvRow {
    fn from(r: &AlarmRecord) -> Self {
        Self {
            record_id: r.id.clone(),
            rule_id: r.rule_id.clone(),
            rule_name: r.rule_name.clone(),
            event_type: r.event_type.to_string(),
            level: r.level.to_string(),
            state: r.state.to_string(),
            category: r.category.clone(),
            trigger_time: r.trigger_time.to_rfc3339_opts(SecondsFormat::Millis, true),
            recover_time: r
                .recover_time
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
                .unwrap_or_default(),
            duration_secs: r.duration_secs.map(|d| format!("{:.3}", d)).unwrap_or_default(),
            message: r.message.clone(),
            threshold: r.threshold.clone(),
            trigger_value: r
                .trigger_value
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_default(),
            responsible_users: r.responsible_users.join(";"),
            ack_user: r.ack_user.clone().unwrap_or_default(),
        }
    }
}

/// Serialize records in the requested format
pub fn render(records: &[AlarmRecord], format: ExportFormat, include_header: bool) -> Result<Vec<u8>> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_vec_pretty(records)?),
        ExportFormat::Csv => {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(include_header)
                .from_writer(Vec::new());
            for record in records {
                writer.serialize(CsvRow::from(record))?;
            }
            writer
                .into_inner()
                .map_err(|e| AlarmError::Record(format!("CSV flush failed: {}", e)))
        },
    }
}

pub fn parse_json(data: &[u8]) -> Result<Vec<AlarmRecord>> {
    Ok(serde_json::from_slice(data)?)
}

/// Read back CSV produced with a header row
pub fn parse_csv<R: Read>(reader: R) -> Result<Vec<CsvRow>> {
    let mut reader = csv::Reader::from_reader(reader);
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::record::types::RecordEventType;
    use chrono::{DateTime, Utc};
    use scada_model::{AlarmLevel, AlarmState, Value};

    fn sample() -> AlarmRecord {
        let t: DateTime<Utc> = "2025-03-01T08:30:00.250Z".parse().unwrap();
        AlarmRecord {
            id: "REC_1".to_string(),
            rule_id: "HIGH_TEMP".to_string(),
            rule_name: "High, hot temperature".to_string(),
            event_type: RecordEventType::Recover,
            level: AlarmLevel::Critical,
            state: AlarmState::Cleared,
            category: "hvac".to_string(),
            trigger_time: t,
            recover_time: Some(t + chrono::Duration::seconds(90)),
            duration_secs: Some(90.0),
            message: "Temp \"high\"".to_string(),
            threshold: ">= 80".to_string(),
            trigger_value: Some(Value::Float(82.5)),
            responsible_users: vec!["alice".to_string(), "bob".to_string()],
            ack_user: Some("alice".to_string()),
            cloud_reported: false,
            storage_path: None,
            created_at: t,
        }
    }

    #[test]
    fn test_csv_columns_and_quoting() {
        let bytes = render(&[sample()], ExportFormat::Csv, true).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let header = text.lines().next().unwrap();
        assert_eq!(
            header,
            "Record ID,Rule ID,Rule Name,Event Type,Level,State,Category,Trigger Time,\
             Recover Time,Duration (s),Message,Threshold,Trigger Value,Responsible Users,Ack User"
        );

        let rows = parse_csv(text.as_bytes()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].rule_name, "High, hot temperature");
        assert_eq!(rows[0].message, "Temp \"high\"");
        assert_eq!(rows[0].trigger_time, "2025-03-01T08:30:00.250Z");
        assert_eq!(rows[0].duration_secs, "90.000");
        assert_eq!(rows[0].responsible_users, "alice;bob");
    }

    #[test]
    fn test_csv_without_header() {
        let bytes = render(&[sample()], ExportFormat::Csv, false).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("REC_1,HIGH_TEMP,"));
    }

    #[test]
    fn test_json_round_trip() {
        let records = vec![sample()];
        let bytes = render(&records, ExportFormat::Json, true).unwrap();
        assert_eq!(parse_json(&bytes).unwrap(), records);
    }
}
