//! SCADA Realtime Variable Store
//!
//! Sharded in-memory storage for device variables with push notification
//! of every write to interested subscribers.
//!
//! ```text
//!   write() ──> shard[id & 63] ──> Dispatcher::publish
//!                                        │  try_send (drop when full)
//!                                        ▼
//!                              bounded queue (10000)
//!                                        │
//!                           ┌────────────┼────────────┐
//!                           ▼            ▼            ▼
//!                       worker 0     worker 1 ...  worker 99
//!                           │  spawn_blocking + timeout
//!                           ▼
//!                       callback(VariableUpdate)
//! ```
//!
//! # Key Components
//!
//! - **VariableStorage trait**: read/write/subscribe interface
//! - **MemoryStorage**: 64-shard in-memory backend
//! - **Dispatcher**: subscription tables and notification worker pool

pub mod dispatcher;

pub mod error;

pub mod memory_impl;

pub mod traits;

pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherStats, SubscriptionMode};
pub use error::{Result, RtdbError};
pub use memory_impl::{MemoryStorage, StorageConfig, SHARD_COUNT};
pub use traits::{StorageStats, UpdateCallback, VariableStorage};

/// Helper functions for common operations
pub mod helpers {
    use super::{MemoryStorage, VariableStorage};
    use anyhow::{Context, Result};
    use scada_model::{QualityCode, Value};
    use std::sync::Arc;

    // ==================== Test Support ====================

    /// Create an in-memory store for unit testing
    ///
    /// Notification workers are not started; call `start()` when a test needs
    /// callbacks delivered.
    pub fn create_test_storage() -> Arc<dyn VariableStorage> {
        Arc::new(MemoryStorage::new())
    }

    pub fn create_test_memory_storage() -> Arc<MemoryStorage> {
        Arc::new(MemoryStorage::new())
    }

    // ==================== Production Helpers ====================

    /// Replace the value of an existing variable, stamping it now
    pub async fn update_value<S>(
        storage: &S,
        id: u64,
        value: impl Into<Value>,
        quality: QualityCode,
    ) -> Result<()>
    where
        S: VariableStorage + ?Sized,
    {
        let mut variable = storage
            .read(id)
            .await
            .with_context(|| format!("Variable {} not found for update", id))?;
        variable.set_value(value.into(), quality, chrono::Utc::now());
        storage
            .write(variable)
            .await
            .with_context(|| format!("Failed to write variable {}", id))?;
        Ok(())
    }
}
