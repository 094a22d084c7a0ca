//! Action handlers.
//!
//! Action nodes name a handler in `config.action`; the handler receives the
//! rest of the node config plus the run context and returns an output that
//! the executor folds back into the context.

mod assign;
mod message;
mod record;
mod registry;
mod task;
pub mod template;
mod webhook;

pub use assign::AssignUserAction;
pub use message::SendMessageAction;
pub use record::UpdateRecordAction;
pub use registry::ActionRegistry;
pub use task::CreateTaskAction;
pub use webhook::CallWebhookAction;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::conditions::Context;
use crate::error::Result;

/// Key under which an output carries values to merge into the run context.
pub const CONTEXT_UPDATES_KEY: &str = "contextUpdates";

/// Result of an action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutput {
    pub data: Value,
}

impl ActionOutput {
    pub fn new(data: Value) -> Self {
        Self { data }
    }

    pub fn empty() -> Self {
        Self::new(Value::Object(Map::new()))
    }

    /// Attach values to merge into the run context.
    pub fn with_context_updates(mut self, updates: Map<String, Value>) -> Self {
        if !self.data.is_object() {
            self.data = serde_json::json!({ "result": self.data });
        }
        if let Value::Object(map) = &mut self.data {
            map.insert(CONTEXT_UPDATES_KEY.to_string(), Value::Object(updates));
        }
        self
    }

    pub fn context_updates(&self) -> Option<&Map<String, Value>> {
        self.data.get(CONTEXT_UPDATES_KEY)?.as_object()
    }
}

/// What an action sees of the run.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub run_id: String,
    pub flow_id: String,
    pub node_id: String,
    pub context: Context,
}

impl ActionContext {
    pub fn new(run_id: &str, flow_id: &str, node_id: &str, context: Context) -> Self {
        Self {
            run_id: run_id.to_string(),
            flow_id: flow_id.to_string(),
            node_id: node_id.to_string(),
            context,
        }
    }
}

/// Trait that all action types implement.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Name used in `config.action` (e.g. "send_message").
    fn action_type(&self) -> &str;

    async fn execute(&self, config: &Value, ctx: &ActionContext) -> Result<ActionOutput>;

    fn description(&self) -> &str {
        "A playbook action"
    }
}

/// Fold an action output into the run context.
///
/// `contextUpdates` members are merged key by key; with an `outputKey` the
/// whole output is also stored under that key.
pub fn apply_output(context: &mut Context, output: &ActionOutput, output_key: Option<&str>) {
    if let Some(updates) = output.context_updates() {
        for (key, value) in updates {
            context.insert(key.clone(), value.clone());
        }
    }
    if let Some(key) = output_key.filter(|k| !k.is_empty()) {
        context.insert(key.to_string(), output.data.clone());
    }
}

/// Deserialize a handler config, mapping failures to a non-retryable error.
pub(crate) fn parse_config<T: serde::de::DeserializeOwned>(
    action: &str,
    config: &Value,
) -> Result<T> {
    serde_json::from_value(config.clone())
        .map_err(|e| crate::error::Error::Config(format!("Invalid {} config: {}", action, e)))
}
