//! Variable → rule index
//!
//! Two-way mapping between variable IDs and the rules that read them.
//! Entries for a rule are replaced wholesale whenever the rule changes.

use rustc_hash::{FxHashMap, FxHashSet};

#[derive(Debug, Default)]
pub struct VariableRuleIndex {
    by_variable: FxHashMap<u64, FxHashSet<String>>,
    by_rule: FxHashMap<String, FxHashSet<u64>>,
}

impl VariableRuleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the variables indexed for `rule_id`
    pub fn set_rule(&mut self, rule_id: &str, variable_ids: FxHashSet<u64>) {
        self.remove_rule(rule_id);
        for id in &variable_ids {
            self.by_variable
                .entry(*id)
                .or_default()
                .insert(rule_id.to_string());
        }
        self.by_rule.insert(rule_id.to_string(), variable_ids);
    }

    pub fn remove_rule(&mut self, rule_id: &str) {
        let Some(old) = self.by_rule.remove(rule_id) else {
            return;
        };
        for id in old {
            if let Some(rules) = self.by_variable.get_mut(&id) {
                rules.remove(rule_id);
                if rules.is_empty() {
                    self.by_variable.remove(&id);
                }
            }
        }
    }

    /// Rule IDs referencing a variable, sorted
    pub fn rules_for_variable(&self, variable_id: u64) -> Vec<String> {
        let mut rules: Vec<String> = self
            .by_variable
            .get(&variable_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        rules.sort();
        rules
    }

    pub fn variables_for_rule(&self, rule_id: &str) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .by_rule
            .get(rule_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub fn variable_count(&self) -> usize {
        self.by_variable.len()
    }

    pub fn clear(&mut self) {
        self.by_variable.clear();
        self.by_rule.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[u64]) -> FxHashSet<u64> {
        list.iter().copied().collect()
    }

    #[test]
    fn test_set_replaces_previous_entries() {
        let mut index = VariableRuleIndex::new();
        index.set_rule("R1", ids(&[1, 2]));
        index.set_rule("R2", ids(&[2]));
        assert_eq!(index.rules_for_variable(2), vec!["R1", "R2"]);

        index.set_rule("R1", ids(&[3]));
        assert!(index.rules_for_variable(1).is_empty());
        assert_eq!(index.rules_for_variable(2), vec!["R2"]);
        assert_eq!(index.variables_for_rule("R1"), vec![3]);
    }

    #[test]
    fn test_remove_prunes_empty_variables() {
        let mut index = VariableRuleIndex::new();
        index.set_rule("R1", ids(&[1, 2]));
        index.remove_rule("R1");
        assert_eq!(index.variable_count(), 0);
        index.remove_rule("missing");
    }
}
