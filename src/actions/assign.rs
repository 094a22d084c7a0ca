//! assign_user - set the run's assignee.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::template::render_template;
use super::{parse_config, ActionContext, ActionHandler, ActionOutput};
use crate::error::{Error, Result};

pub struct AssignUserAction;

impl AssignUserAction {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AssignUserAction {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignConfig {
    #[serde(default)]
    user_id: Option<String>,
    /// Round-robin candidates when no explicit user is given
    #[serde(default)]
    pool: Vec<String>,
}

/// Pick a pool member from the run id so that re-running a step is stable.
fn pick(pool: &[String], run_id: &str) -> usize {
    let hash = run_id
        .bytes()
        .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
    (hash % pool.len() as u64) as usize
}

#[async_trait]
impl ActionHandler for AssignUserAction {
    fn action_type(&self) -> &str {
        "assign_user"
    }

    fn description(&self) -> &str {
        "Assign the lead to a user or a rotating pool"
    }

    async fn execute(&self, config: &Value, ctx: &ActionContext) -> Result<ActionOutput> {
        let config: AssignConfig = parse_config(self.action_type(), config)?;

        let assignee = match config.user_id {
            Some(user) => render_template(&user, &ctx.context),
            None if !config.pool.is_empty() => {
                config.pool[pick(&config.pool, &ctx.run_id)].clone()
            }
            None => {
                return Err(Error::Config(
                    "assign_user needs either userId or a non-empty pool".to_string(),
                ))
            }
        };

        let mut updates = Map::new();
        updates.insert("assignee".to_string(), json!(assignee));
        Ok(ActionOutput::new(json!({ "assignee": assignee })).with_context_updates(updates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(run_id: &str) -> ActionContext {
        ActionContext::new(run_id, "flow", "assign", Map::new())
    }

    #[tokio::test]
    async fn test_explicit_user() {
        let output = AssignUserAction::new()
            .execute(&json!({"userId": "u-7"}), &ctx("r1"))
            .await
            .unwrap();
        assert_eq!(output.context_updates().unwrap()["assignee"], "u-7");
    }

    #[tokio::test]
    async fn test_pool_is_deterministic_per_run() {
        let config = json!({"pool": ["a", "b", "c"]});
        let action = AssignUserAction::new();
        let first = action.execute(&config, &ctx("run-42")).await.unwrap();
        let second = action.execute(&config, &ctx("run-42")).await.unwrap();
        assert_eq!(first, second);
        let picked = first.data["assignee"].as_str().unwrap().to_string();
        assert!(["a", "b", "c"].contains(&picked.as_str()));
    }

    #[tokio::test]
    async fn test_requires_user_or_pool() {
        let err = AssignUserAction::new()
            .execute(&json!({}), &ctx("r"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
