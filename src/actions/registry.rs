//! Action registry - maps `config.action` names to handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::{
    ActionContext, ActionHandler, ActionOutput, AssignUserAction, CallWebhookAction,
    CreateTaskAction, SendMessageAction, UpdateRecordAction,
};
use crate::error::{Error, Result};
use crate::storage::TaskStore;

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Registry of available action types.
#[derive(Clone)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    /// Create a registry with the built-in actions and no external wiring.
    pub fn new() -> Self {
        Self::builtin(None, None)
    }

    /// Built-in actions wired to a messaging endpoint and a task store.
    pub fn builtin(messaging_endpoint: Option<String>, tasks: Option<Arc<dyn TaskStore>>) -> Self {
        let mut registry = Self::empty();
        let timeout = Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS);

        registry.register(Arc::new(SendMessageAction::new(messaging_endpoint, timeout)));
        registry.register(Arc::new(AssignUserAction::new()));
        registry.register(Arc::new(CallWebhookAction::new(timeout)));
        registry.register(Arc::new(UpdateRecordAction::new()));
        registry.register(Arc::new(CreateTaskAction::new(tasks)));

        registry
    }

    /// Create an empty registry (for testing).
    pub fn empty() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    pub fn register(&mut self, action: Arc<dyn ActionHandler>) {
        self.actions.insert(action.action_type().to_string(), action);
    }

    pub fn get(&self, action_type: &str) -> Option<Arc<dyn ActionHandler>> {
        self.actions.get(action_type).cloned()
    }

    pub fn has(&self, action_type: &str) -> bool {
        self.actions.contains_key(action_type)
    }

    /// Execute an action by type.
    pub async fn execute(
        &self,
        action_type: &str,
        config: &Value,
        ctx: &ActionContext,
    ) -> Result<ActionOutput> {
        let action = self
            .get(action_type)
            .ok_or_else(|| Error::Config(format!("Unknown action type: {}", action_type)))?;

        action.execute(config, ctx).await
    }

    /// List all registered action types, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    #[test]
    fn test_registry_builtin_actions() {
        let registry = ActionRegistry::new();
        assert_eq!(
            registry.list(),
            vec![
                "assign_user",
                "call_webhook",
                "create_task",
                "send_message",
                "update_record"
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let registry = ActionRegistry::empty();
        let ctx = ActionContext::new("run", "flow", "node", Map::new());
        let err = registry
            .execute("fax", &json!({}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!err.is_retryable());
    }
}
