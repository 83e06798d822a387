//! Rule Manager - in-memory alarm rule registry
//!
//! Holds the rule set and keeps the variable → rule index in step with it.
//! Every accessor returns clones.

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::error::{AlarmError, Result};
use crate::rule::AlarmRule;
use crate::variable_index::VariableRuleIndex;

#[derive(Default)]
struct Registry {
    rules: FxHashMap<String, AlarmRule>,
    index: VariableRuleIndex,
}

/// Rule statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleStats {
    pub total: usize,
    pub enabled: usize,
    pub disabled: usize,
    pub by_category: BTreeMap<String, usize>,
    pub by_level: BTreeMap<String, usize>,
}

#[derive(Default)]
pub struct RuleManager {
    registry: RwLock<Registry>,
}

impl RuleManager {
    pub fn new() -> Self {
        Self::default()
    }

    // ========== CRUD ==========

    pub fn add_rule(&self, rule: AlarmRule) -> Result<()> {
        rule.validate()?;
        let mut registry = self.registry.write();
        if registry.rules.contains_key(&rule.id) {
            return Err(AlarmError::RuleAlreadyExists(rule.id));
        }
        registry.index.set_rule(&rule.id, rule.variable_ids());
        info!("Rule added: {} ({})", rule.id, rule.name);
        registry.rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    /// Replace an existing rule, returning the previous definition
    pub fn update_rule(&self, rule: AlarmRule) -> Result<AlarmRule> {
        rule.validate()?;
        let mut registry = self.registry.write();
        if !registry.rules.contains_key(&rule.id) {
            return Err(AlarmError::RuleNotFound(rule.id));
        }
        registry.index.set_rule(&rule.id, rule.variable_ids());
        debug!("Rule updated: {}", rule.id);
        let id = rule.id.clone();
        registry
            .rules
            .insert(id.clone(), rule)
            .ok_or(AlarmError::RuleNotFound(id))
    }

    pub fn remove_rule(&self, rule_id: &str) -> Result<AlarmRule> {
        let mut registry = self.registry.write();
        let rule = registry
            .rules
            .remove(rule_id)
            .ok_or_else(|| AlarmError::RuleNotFound(rule_id.to_string()))?;
        registry.index.remove_rule(rule_id);
        info!("Rule removed: {}", rule_id);
        Ok(rule)
    }

    pub fn get_rule(&self, rule_id: &str) -> Option<AlarmRule> {
        self.registry.read().rules.get(rule_id).cloned()
    }

    pub fn set_enabled(&self, rule_id: &str, enabled: bool) -> Result<()> {
        let mut registry = self.registry.write();
        let rule = registry
            .rules
            .get_mut(rule_id)
            .ok_or_else(|| AlarmError::RuleNotFound(rule_id.to_string()))?;
        rule.enabled = enabled;
        Ok(())
    }

    pub fn enable_rule(&self, rule_id: &str) -> Result<()> {
        self.set_enabled(rule_id, true)
    }

    pub fn disable_rule(&self, rule_id: &str) -> Result<()> {
        self.set_enabled(rule_id, false)
    }

    // ========== Queries ==========

    /// All rules, sorted by ID
    pub fn list_rules(&self) -> Vec<AlarmRule> {
        let mut rules: Vec<AlarmRule> = self.registry.read().rules.values().cloned().collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    pub fn list_enabled_rules(&self) -> Vec<AlarmRule> {
        let mut rules: Vec<AlarmRule> = self
            .registry
            .read()
            .rules
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    pub fn rules_by_category(&self, category: &str) -> Vec<AlarmRule> {
        self.list_rules()
            .into_iter()
            .filter(|r| r.category == category)
            .collect()
    }

    /// Enabled rules reading `variable_id`
    pub fn rules_for_variable(&self, variable_id: u64) -> Vec<AlarmRule> {
        let registry = self.registry.read();
        registry
            .index
            .rules_for_variable(variable_id)
            .iter()
            .filter_map(|id| registry.rules.get(id))
            .filter(|r| r.enabled)
            .cloned()
            .collect()
    }

    /// Union of variables read by enabled rules, sorted
    pub fn variable_ids(&self) -> Vec<u64> {
        let registry = self.registry.read();
        let ids: FxHashSet<u64> = registry
            .rules
            .values()
            .filter(|r| r.enabled)
            .flat_map(|r| registry.index.variables_for_rule(&r.id))
            .collect();
        let mut ids: Vec<u64> = ids.into_iter().collect();
        ids.sort_unstable();
        ids
    }

    pub fn variables_for_rule(&self, rule_id: &str) -> Vec<u64> {
        self.registry.read().index.variables_for_rule(rule_id)
    }

    pub fn count(&self) -> usize {
        self.registry.read().rules.len()
    }

    pub fn stats(&self) -> RuleStats {
        let registry = self.registry.read();
        let mut stats = RuleStats {
            total: registry.rules.len(),
            ..RuleStats::default()
        };
        for rule in registry.rules.values() {
            if rule.enabled {
                stats.enabled += 1;
            } else {
                stats.disabled += 1;
            }
            *stats.by_category.entry(rule.category.clone()).or_default() += 1;
            *stats
                .by_level
                .entry(rule.level.as_str().to_string())
                .or_default() += 1;
        }
        stats
    }

    pub fn clear(&self) {
        let mut registry = self.registry.write();
        registry.rules.clear();
        registry.index.clear();
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::condition::{Condition, Operator, SingleCondition};
    use scada_model::AlarmLevel;

    fn rule(id: &str, var: u64) -> AlarmRule {
        AlarmRule::new(id, id, SingleCondition::new(var, Operator::Gt, 10.0).into())
    }

    #[test]
    fn test_add_duplicate_rejected() {
        let manager = RuleManager::new();
        manager.add_rule(rule("R1", 1)).unwrap();
        assert!(matches!(
            manager.add_rule(rule("R1", 2)),
            Err(AlarmError::RuleAlreadyExists(_))
        ));
    }

    #[test]
    fn test_invalid_rule_rejected() {
        let manager = RuleManager::new();
        let bad = AlarmRule::new("R1", "bad", Condition::or(vec![]));
        assert!(manager.add_rule(bad).is_err());
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn test_update_reindexes() {
        let manager = RuleManager::new();
        manager.add_rule(rule("R1", 1)).unwrap();
        let old = manager.update_rule(rule("R1", 2)).unwrap();
        assert_eq!(old.condition.variable_ids().into_iter().next(), Some(1));

        assert!(manager.rules_for_variable(1).is_empty());
        assert_eq!(manager.rules_for_variable(2).len(), 1);
        assert!(manager.update_rule(rule("R9", 1)).is_err());
    }

    #[test]
    fn test_disabled_rules_excluded_from_lookups() {
        let manager = RuleManager::new();
        manager.add_rule(rule("R1", 1)).unwrap();
        manager.add_rule(rule("R2", 1)).unwrap();
        manager.disable_rule("R2").unwrap();

        let ids: Vec<String> = manager.rules_for_variable(1).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["R1"]);
        assert_eq!(manager.list_enabled_rules().len(), 1);

        manager.disable_rule("R1").unwrap();
        assert!(manager.variable_ids().is_empty());
    }

    #[test]
    fn test_stats_and_categories() {
        let manager = RuleManager::new();
        manager
            .add_rule(rule("R1", 1).with_category("power").with_level(AlarmLevel::High))
            .unwrap();
        manager.add_rule(rule("R2", 2).with_category("power")).unwrap();
        manager.add_rule(rule("R3", 3).with_category("hvac")).unwrap();
        manager.disable_rule("R3").unwrap();

        let stats = manager.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.enabled, 2);
        assert_eq!(stats.disabled, 1);
        assert_eq!(stats.by_category["power"], 2);
        assert_eq!(stats.by_level["high"], 1);
        assert_eq!(manager.rules_by_category("hvac").len(), 1);

        manager.remove_rule("R1").unwrap();
        assert!(manager.remove_rule("R1").is_err());
        assert_eq!(manager.variable_ids(), vec![2]);
    }
}
