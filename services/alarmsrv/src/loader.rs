//! Rule and variable file loading

use anyhow::{Context, Result};
use scada_alarm::AlarmRule;
use scada_model::{Value, Variable};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Variable declared in the startup file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSeed {
    pub id: u64,
    pub string_id: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub value: Value,
}

impl From<VariableSeed> for Variable {
    fn from(seed: VariableSeed) -> Self {
        let mut variable = Variable::new(seed.id, seed.string_id, seed.device_id).with_value(seed.value);
        variable.name = seed.name;
        variable.unit = seed.unit;
        variable
    }
}

pub async fn load_rules(path: &Path) -> Result<Vec<AlarmRule>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading rule file {}", path.display()))?;
    let rules = scada_alarm::helpers::parse_rules_yaml(&text)
        .with_context(|| format!("parsing rule file {}", path.display()))?;
    info!("Loaded {} rule(s) from {}", rules.len(), path.display());
    Ok(rules)
}

pub async fn load_variables(path: &Path) -> Result<Vec<Variable>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading variable file {}", path.display()))?;
    let seeds: Vec<VariableSeed> = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing variable file {}", path.display()))?;
    Ok(seeds.into_iter().map(Variable::from).collect())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use scada_alarm::{Condition, Operator};
    use std::io::Write;

    const RULES: &str = r#"
- id: HIGH_TEMP
  name: High temperature
  level: high
  category: hvac
  message: "Temperature {var:1}"
  condition:
    type: single
    variable_id: 1
    operator: ">="
    threshold: { type: static, value: 80 }
    deadband: 2.0
- id: PUMP_TRIP
  name: Pump trip
  condition:
    type: group
    logic: and
    conditions:
      - { type: single, variable_id: 2, operator: rising_edge }
      - { type: single, variable_id: 3, operator: ">", threshold: { type: static, value: 0.5 } }
"#;

    #[tokio::test]
    async fn test_load_rules() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(RULES.as_bytes()).unwrap();

        let rules = load_rules(file.path()).await.unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].level, scada_model::AlarmLevel::High);
        assert!(rules[0].enabled);
        match &rules[0].condition {
            Condition::Single(single) => {
                assert_eq!(single.operator, Operator::Gte);
                assert_eq!(single.deadband, 2.0);
            },
            other => panic!("unexpected condition {:?}", other),
        }
        assert!(matches!(rules[1].condition, Condition::Group(_)));
    }

    #[tokio::test]
    async fn test_invalid_rule_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "- id: BAD\n  name: Bad\n  condition: {{ type: group, logic: or, conditions: [] }}"
        )
        .unwrap();
        assert!(load_rules(file.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_load_variables() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "- {{ id: 1, string_id: AI-AHU01-TEMP, device_id: AHU01, unit: C, value: 21.5 }}"
        )
        .unwrap();
        let vars = load_variables(file.path()).await.unwrap();
        assert_eq!(vars[0].device_id, "AHU01");
        assert_eq!(vars[0].value, Value::Float(21.5));
    }

    #[tokio::test]
    async fn test_bundled_config_files() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("config");
        let rules = load_rules(&dir.join("alarm_rules.yaml")).await.unwrap();
        assert_eq!(rules.len(), 3);
        let vars = load_variables(&dir.join("variables.yaml")).await.unwrap();
        assert_eq!(vars.len(), 5);

        let config = crate::config::AlarmsrvConfig::load(Some(&dir.join("alarmsrv.yaml"))).unwrap();
        assert_eq!(config.consumer.recover_delay_ms, 3000);
    }
}
