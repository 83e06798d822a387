//! AlarmSrv Configuration
//!
//! Loaded from `config/alarmsrv.yaml` and `ALARMSRV_*` environment
//! variables (nested keys split on `__`, e.g. `ALARMSRV_CONSUMER__EVAL_WORKERS`).

use anyhow::{bail, Result};
use scada_alarm::{AlarmConsumerConfig, RecordConfig};
use scada_rtdb::StorageConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config/alarmsrv.yaml";
pub const ENV_PREFIX: &str = "ALARMSRV_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    /// Log root; `SCADA_LOG_DIR` takes precedence
    pub log_dir: Option<String>,
    /// Filter directive when `RUST_LOG` is unset
    pub log_level: Option<String>,
    pub log_json: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "alarmsrv".to_string(),
            log_dir: None,
            log_level: None,
            log_json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmsrvConfig {
    pub service: ServiceConfig,
    /// YAML list of alarm rules
    pub rules_file: PathBuf,
    /// Optional YAML list of variables created at startup
    pub variables_file: Option<PathBuf>,
    pub storage: StorageConfig,
    pub consumer: AlarmConsumerConfig,
    pub record: RecordConfig,
}

impl Default for AlarmsrvConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            rules_file: PathBuf::from("config/alarm_rules.yaml"),
            variables_file: None,
            storage: StorageConfig::default(),
            consumer: AlarmConsumerConfig::default(),
            record: RecordConfig::default(),
        }
    }
}

impl AlarmsrvConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let config: Self = common::load_config(Some(path), ENV_PREFIX)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.consumer.eval_workers == 0 {
            bail!("consumer.eval_workers must be at least 1");
        }
        if self.storage.dispatcher.workers == 0 {
            bail!("storage.dispatcher.workers must be at least 1");
        }
        if self.record.batch_size == 0 {
            bail!("record.batch_size must be at least 1");
        }
        if self.record.max_days == 0 {
            bail!("record.max_days must be at least 1");
        }
        Ok(())
    }
}
