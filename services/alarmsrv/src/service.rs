//! Service assembly and lifecycle

use anyhow::{Context, Result};
use scada_alarm::{AlarmConsumer, JsonFileStorage, RecordManager, RuleManager, TemplateRenderer};
use scada_rtdb::{MemoryStorage, VariableStorage};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::AlarmsrvConfig;
use crate::loader::{load_rules, load_variables};

pub struct AlarmService {
    config: AlarmsrvConfig,
    storage: Arc<MemoryStorage>,
    consumer: AlarmConsumer,
}

impl AlarmService {
    /// Build the store, record manager and consumer, and load rules
    pub async fn build(config: AlarmsrvConfig) -> Result<Self> {
        let storage = Arc::new(MemoryStorage::with_config(config.storage.clone()));
        if let Some(path) = &config.variables_file {
            let variables = load_variables(path).await?;
            let count = variables.len();
            for variable in variables {
                let id = variable.id;
                storage
                    .write(variable)
                    .await
                    .with_context(|| format!("seeding variable {}", id))?;
            }
            info!("Seeded {} variable(s) from {}", count, path.display());
        }

        let record_storage = JsonFileStorage::open(&config.record.base_path)
            .await
            .with_context(|| format!("opening record store {}", config.record.base_path.display()))?;
        let records = Arc::new(RecordManager::new(config.record.clone(), Arc::new(record_storage)));

        let store: Arc<dyn VariableStorage> = storage.clone();
        let consumer = AlarmConsumer::new(config.consumer.clone(), store, Arc::new(RuleManager::new()), records);
        consumer.set_renderer(Arc::new(TemplateRenderer::new()?));

        if config.rules_file.exists() {
            for rule in load_rules(&config.rules_file).await? {
                consumer.add_rule(rule)?;
            }
        } else {
            warn!("Rule file {} not found, starting without rules", config.rules_file.display());
        }

        Ok(Self {
            config,
            storage,
            consumer,
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.storage.start().await?;
        self.consumer.start().await?;
        info!(
            "{} running: {} rule(s), {} variable(s)",
            self.config.service.name,
            self.consumer.rule_manager().count(),
            self.storage.stats().variable_count
        );
        Ok(())
    }

    /// Stop the consumer first so its subscriptions are gone before the store stops
    pub async fn shutdown(&self) -> Result<()> {
        self.consumer.stop().await?;
        self.storage.stop().await?;

        let stats = self.consumer.stats();
        info!(
            "Shutdown complete: {} evaluations, {} triggers, {} recoveries, {} dropped",
            stats.evaluations, stats.triggers, stats.recoveries, stats.dropped_tasks
        );
        Ok(())
    }

    pub fn config(&self) -> &AlarmsrvConfig {
        &self.config
    }

    /// Store handle for collectors writing variable values
    pub fn storage(&self) -> &Arc<MemoryStorage> {
        &self.storage
    }

    pub fn consumer(&self) -> &AlarmConsumer {
        &self.consumer
    }
}
