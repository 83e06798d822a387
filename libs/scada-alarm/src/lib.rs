//! SCADA Alarm Engine
//!
//! Evaluates alarm rules against the realtime variable store and keeps an
//! auditable record of every trigger, recovery and shielded evaluation.
//!
//! ```text
//!   VariableStorage ──subscribe──> AlarmConsumer ──try_send──> eval queue (workers * 2)
//!                                                                   │
//!                                                        eval workers (timeout)
//!                                                                   │
//!                                                   ConditionEvaluator
//!                                           (enable condition, deadband, edge, delay)
//!                                                                   │
//!                                          Triggered / NotTriggered / Pending / Shielded
//!                                                                   │
//!                                 AlarmStateMachine ──> ActiveAlarm table
//!                                         │                         │
//!                                  RecordManager             ActionExecutor
//!                              (cache, batch writer,          (fire and forget)
//!                               JSON files, export)
//! ```
//!
//! # Key Components
//!
//! - **Condition / AlarmRule**: declarative rule model (serde, YAML friendly)
//! - **RuleManager**: rule registry with the variable → rule index
//! - **ConditionEvaluator**: per-rule evaluation with deadband/edge/delay filters
//! - **AlarmStateMachine**: validated state transitions with history
//! - **AlarmConsumer**: subscription, worker pool and outcome handling
//! - **RecordManager**: event records, queries and JSON/CSV export

pub mod action;
pub mod alarm;
pub mod condition;
pub mod consumer;
pub mod content;
pub mod engine;
pub mod error;
pub mod record;
pub mod rule;
pub mod rule_manager;
pub mod variable_index;

pub use action::{ActionExecutor, LoggingActionExecutor};
pub use alarm::ActiveAlarm;
pub use condition::{Condition, ConditionGroup, Logic, Operator, SingleCondition, Threshold};
pub use consumer::{AlarmConsumer, AlarmConsumerConfig, ConsumerStats, AGGREGATED_SUBSCRIBER};
pub use content::{render_message, ContentRenderer, TemplateRenderer};
pub use engine::{AlarmStateMachine, ConditionEvaluator, RuleOutcome, StateTransition};
pub use error::{AlarmError, Result};
pub use record::{
    AlarmRecord, ExportFormat, ExportOptions, JsonFileStorage, RecordConfig, RecordEventType,
    RecordManager, RecordQuery, RecordStorage,
};
pub use rule::{Action, AlarmRule};
pub use rule_manager::{RuleManager, RuleStats};
pub use variable_index::VariableRuleIndex;

/// Helper functions for common operations
pub mod helpers {
    use super::{AlarmRule, JsonFileStorage, RecordConfig, RecordManager, Result};
    use std::path::Path;
    use std::sync::Arc;

    // ==================== Test Support ====================

    /// Record manager over a JSON store rooted at `dir`, exporting to `dir/exports`
    pub async fn create_test_record_manager(dir: &Path) -> Result<Arc<RecordManager>> {
        let storage = JsonFileStorage::open(dir.join("records")).await?;
        let config = RecordConfig {
            base_path: dir.join("records"),
            export_dir: dir.join("exports"),
            batch_size: 1,
            batch_timeout_ms: 50,
            ..RecordConfig::default()
        };
        Ok(Arc::new(RecordManager::new(config, Arc::new(storage))))
    }

    // ==================== Production Helpers ====================

    /// Parse a YAML rule list
    pub fn parse_rules_yaml(text: &str) -> anyhow::Result<Vec<AlarmRule>> {
        let rules: Vec<AlarmRule> = serde_yaml::from_str(text)?;
        for rule in &rules {
            rule.validate()
                .map_err(|e| anyhow::anyhow!("rule {}: {}", rule.id, e))?;
        }
        Ok(rules)
    }
}
