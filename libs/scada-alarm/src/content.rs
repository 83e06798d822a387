//! Alarm message rendering
//!
//! Templates reference live values as `{var:ID}`; unit suffixes are added
//! when the variable has one.

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use rustc_hash::FxHashMap;
use scada_rtdb::VariableStorage;
use tracing::debug;

use crate::rule::AlarmRule;

/// Placeholder for values that cannot be read
pub const UNAVAILABLE: &str = "[N/A]";

const VAR_PATTERN: &str = r"\{var:(\d+)\}";

#[async_trait]
pub trait ContentRenderer: Send + Sync + 'static {
    async fn render(&self, template: &str, storage: &dyn VariableStorage) -> anyhow::Result<String>;
}

pub struct TemplateRenderer {
    pattern: Regex,
}

impl TemplateRenderer {
    pub fn new() -> anyhow::Result<Self> {
        let pattern = Regex::new(VAR_PATTERN).context("invalid template pattern")?;
        Ok(Self { pattern })
    }

    /// Variable IDs referenced by a template, in order of appearance
    pub fn referenced_ids(&self, template: &str) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .pattern
            .captures_iter(template)
            .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse().ok()))
            .collect();
        ids.dedup();
        ids
    }
}

#[async_trait]
impl ContentRenderer for TemplateRenderer {
    async fn render(&self, template: &str, storage: &dyn VariableStorage) -> anyhow::Result<String> {
        let ids = self.referenced_ids(template);
        if ids.is_empty() {
            return Ok(template.to_string());
        }

        let values: FxHashMap<u64, String> = storage
            .read_batch(&ids)
            .await
            .context("reading template variables")?
            .into_iter()
            .filter(|v| v.quality.is_good())
            .map(|v| {
                let text = if v.unit.is_empty() {
                    v.value.to_string()
                } else {
                    format!("{}{}", v.value, v.unit)
                };
                (v.id, text)
            })
            .collect();

        let rendered = self.pattern.replace_all(template, |caps: &regex::Captures<'_>| {
            caps.get(1)
                .and_then(|m| m.as_str().parse::<u64>().ok())
                .and_then(|id| values.get(&id).cloned())
                .unwrap_or_else(|| UNAVAILABLE.to_string())
        });
        Ok(rendered.into_owned())
    }
}

/// Message for a rule: rendered template, else the rule name
pub async fn render_message(
    renderer: Option<&dyn ContentRenderer>,
    rule: &AlarmRule,
    storage: &dyn VariableStorage,
) -> String {
    let (Some(renderer), Some(template)) = (renderer, rule.message.as_deref()) else {
        return rule.name.clone();
    };
    match renderer.render(template, storage).await {
        Ok(text) if !text.is_empty() => text,
        Ok(_) => rule.name.clone(),
        Err(e) => {
            debug!("Message render failed for {}: {:#}", rule.id, e);
            rule.name.clone()
        },
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::condition::{Operator, SingleCondition};
    use scada_model::{QualityCode, Variable};
    use scada_rtdb::MemoryStorage;

    async fn storage() -> MemoryStorage {
        let storage = MemoryStorage::new();
        let mut temp = Variable::new(1, "AI-PUMP01-TEMP", "PUMP01").with_value(82.5);
        temp.unit = "C".to_string();
        storage.write(temp).await.unwrap();
        storage
            .write(
                Variable::new(2, "AI-PUMP01-FLOW", "PUMP01")
                    .with_value(3.0)
                    .with_quality(QualityCode::Bad),
            )
            .await
            .unwrap();
        storage
    }

    #[tokio::test]
    async fn test_substitutes_values() {
        let storage = storage().await;
        let renderer = TemplateRenderer::new().unwrap();
        let text = renderer
            .render("Temp {var:1}, flow {var:2}, level {var:9}", &storage)
            .await
            .unwrap();
        assert_eq!(text, "Temp 82.5C, flow [N/A], level [N/A]");
    }

    #[test]
    fn test_referenced_ids() {
        let renderer = TemplateRenderer::new().unwrap();
        assert_eq!(renderer.referenced_ids("{var:3} {var:10} {var:x}"), vec![3, 10]);
        assert!(renderer.referenced_ids("plain").is_empty());
    }

    #[tokio::test]
    async fn test_render_message_falls_back_to_name() {
        let storage = storage().await;
        let renderer = TemplateRenderer::new().unwrap();
        let mut rule = AlarmRule::new("R1", "Pump overheat", SingleCondition::new(1, Operator::Gt, 80.0).into());

        assert_eq!(render_message(Some(&renderer), &rule, &storage).await, "Pump overheat");

        rule.message = Some("Pump at {var:1}".to_string());
        assert_eq!(render_message(Some(&renderer), &rule, &storage).await, "Pump at 82.5C");
        assert_eq!(render_message(None, &rule, &storage).await, "Pump overheat");
    }
}
