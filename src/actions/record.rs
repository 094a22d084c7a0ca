//! update_record - merge templated fields into the run context.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::template::render_value;
use super::{parse_config, ActionContext, ActionHandler, ActionOutput};
use crate::error::Result;

pub struct UpdateRecordAction;

impl UpdateRecordAction {
    pub fn new() -> Self {
        Self
    }
}

impl Default for UpdateRecordAction {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct RecordConfig {
    fields: Map<String, Value>,
}

#[async_trait]
impl ActionHandler for UpdateRecordAction {
    fn action_type(&self) -> &str {
        "update_record"
    }

    fn description(&self) -> &str {
        "Update fields on the lead record"
    }

    async fn execute(&self, config: &Value, ctx: &ActionContext) -> Result<ActionOutput> {
        let config: RecordConfig = parse_config(self.action_type(), config)?;
        let updates: Map<String, Value> = config
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), render_value(v, &ctx.context)))
            .collect();

        let updated: Vec<&String> = updates.keys().collect();
        Ok(ActionOutput::new(json!({ "updated": updated })).with_context_updates(updates.clone()))
    }
}
