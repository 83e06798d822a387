//! Alarm event records: types, JSON file storage, export and the
//! batching record manager

pub mod export;
pub mod manager;
pub mod storage;
pub mod types;

pub use manager::{ExportResult, RecordConfig, RecordManager};
pub use storage::{JsonFileStorage, RecordStorage};
pub use types::{
    AlarmRecord, ExportFormat, ExportOptions, QueryResult, RecordEventType, RecordQuery, RecordStats,
    SortField,
};
