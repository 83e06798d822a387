//! Trait definitions for the variable store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scada_model::{Variable, VariableUpdate};
use serde::Serialize;
use std::sync::Arc;

use crate::error::Result;

/// Subscriber callback, invoked off the publisher's stack by a dispatcher worker
pub type UpdateCallback = Arc<dyn Fn(VariableUpdate) + Send + Sync + 'static>;

/// Unified variable storage trait
///
/// Point/batch reads and writes, explicit create/delete, subscriptions and
/// statistics. Implementations:
/// - `MemoryStorage`: sharded in-memory backend
#[async_trait]
pub trait VariableStorage: Send + Sync + 'static {
    // ========== Lifecycle ==========

    /// Start notification workers
    async fn start(&self) -> Result<()>;

    /// Stop notification workers; pending notifications are discarded
    async fn stop(&self) -> Result<()>;

    // ========== Read Operations ==========

    /// Read a copy of one variable
    async fn read(&self, id: u64) -> Result<Variable>;

    /// Read many variables; missing IDs are simply absent from the result
    async fn read_batch(&self, ids: &[u64]) -> Result<Vec<Variable>>;

    async fn read_by_string_id(&self, string_id: &str) -> Result<Variable>;

    // ========== Write Operations ==========

    /// Upsert a variable and publish one update event
    ///
    /// Existing variables only get value/quality/timestamp replaced.
    async fn write(&self, variable: Variable) -> Result<()>;

    /// Upsert many variables, grouped per shard
    async fn write_batch(&self, variables: Vec<Variable>) -> Result<()>;

    /// Insert a new variable, failing if the ID exists
    ///
    /// ID 0 allocates the next free custom ID. Returns the ID used.
    async fn create_variable(&self, variable: Variable) -> Result<u64>;

    async fn delete_variable(&self, id: u64) -> Result<()>;

    // ========== Scans ==========

    async fn list_variables(&self) -> Result<Vec<Variable>>;

    async fn list_variables_by_device(&self, device_id: &str) -> Result<Vec<Variable>>;

    // ========== Subscriptions ==========

    /// Exact-ID subscription
    fn subscribe(&self, subscriber_id: &str, variable_ids: &[u64], callback: UpdateCallback)
        -> Result<()>;

    fn subscribe_by_device(
        &self,
        subscriber_id: &str,
        device_id: &str,
        callback: UpdateCallback,
    ) -> Result<()>;

    /// `*` in the pattern selects wildcard mode, a trailing `-` prefix mode,
    /// anything else matches the string ID exactly
    fn subscribe_by_pattern(
        &self,
        subscriber_id: &str,
        pattern: &str,
        callback: UpdateCallback,
    ) -> Result<()>;

    fn unsubscribe(&self, subscriber_id: &str, variable_ids: &[u64]) -> Result<()>;

    fn unsubscribe_all(&self, subscriber_id: &str) -> Result<()>;

    // ========== Statistics ==========

    fn stats(&self) -> StorageStats;
}

/// Store and dispatcher counters
#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub variable_count: usize,
    pub subscriber_count: usize,
    pub subscription_count: usize,
    pub read_count: u64,
    pub write_count: u64,
    pub notifications_delivered: u64,
    pub notifications_dropped: u64,
    pub callback_timeouts: u64,
    pub callback_panics: u64,
    pub start_time: DateTime<Utc>,
}
