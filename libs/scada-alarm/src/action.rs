//! Trigger/recover action execution seam

use async_trait::async_trait;
use tracing::info;

use crate::alarm::ActiveAlarm;
use crate::rule::Action;

/// Runs a rule's trigger or recover actions. Called fire-and-forget by the
/// consumer; errors are logged there.
#[async_trait]
pub trait ActionExecutor: Send + Sync + 'static {
    async fn execute_batch(&self, actions: &[Action], alarm: &ActiveAlarm) -> anyhow::Result<()>;
}

/// Logs each action instead of dispatching it
#[derive(Debug, Default, Clone)]
pub struct LoggingActionExecutor;

#[async_trait]
impl ActionExecutor for LoggingActionExecutor {
    async fn execute_batch(&self, actions: &[Action], alarm: &ActiveAlarm) -> anyhow::Result<()> {
        for action in actions {
            info!(
                rule_id = %alarm.rule_id,
                state = %alarm.state,
                "Action {} -> {} {:?}",
                action.action_type,
                action.target,
                action.params
            );
        }
        Ok(())
    }
}
