//! create_task - open a follow-up task with an optional SLA.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::template::render_template;
use super::{parse_config, ActionContext, ActionHandler, ActionOutput};
use crate::error::{Error, Result};
use crate::storage::TaskStore;
use crate::tasks::{Task, TaskPriority};

pub struct CreateTaskAction {
    store: Option<Arc<dyn TaskStore>>,
}

impl CreateTaskAction {
    pub fn new(store: Option<Arc<dyn TaskStore>>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskConfig {
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    assignee: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    sla_hours: Option<f64>,
}

#[async_trait]
impl ActionHandler for CreateTaskAction {
    fn action_type(&self) -> &str {
        "create_task"
    }

    fn description(&self) -> &str {
        "Create a follow-up task for a sales rep"
    }

    async fn execute(&self, config: &Value, ctx: &ActionContext) -> Result<ActionOutput> {
        let config: TaskConfig = parse_config(self.action_type(), config)?;

        let mut task = Task::new(render_template(&config.title, &ctx.context));
        task.run_id = Some(ctx.run_id.clone());
        task.flow_id = Some(ctx.flow_id.clone());
        if let Some(description) = &config.description {
            task.description = render_template(description, &ctx.context);
        }
        // Falls back to whoever the run is assigned to
        task.assignee = config
            .assignee
            .as_deref()
            .map(|a| render_template(a, &ctx.context))
            .or_else(|| {
                ctx.context
                    .get("assignee")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .filter(|a| !a.is_empty());
        if let Some(priority) = &config.priority {
            task.priority = priority
                .parse::<TaskPriority>()
                .map_err(Error::Config)?;
        }
        if let Some(hours) = config.sla_hours {
            if !hours.is_finite() || hours <= 0.0 {
                return Err(Error::Config(format!("slaHours must be positive, got {}", hours)));
            }
            task = task.with_sla_hours(hours)?;
        }

        let persisted = match &self.store {
            Some(store) => {
                store.save_task(&task).await?;
                info!(task_id = %task.id, run_id = %ctx.run_id, "Task created");
                true
            }
            None => {
                warn!(run_id = %ctx.run_id, "No task store configured, task not persisted");
                false
            }
        };

        let mut updates = Map::new();
        updates.insert("lastTaskId".to_string(), json!(task.id));

        let mut data = serde_json::to_value(&task)?;
        data["persisted"] = json!(persisted);
        Ok(ActionOutput::new(data).with_context_updates(updates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;

    #[tokio::test]
    async fn test_creates_and_persists_task() {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let action = CreateTaskAction::new(Some(storage.clone()));
        let context = json!({"name": "Huda", "assignee": "rep-1"})
            .as_object()
            .cloned()
            .unwrap();
        let ctx = ActionContext::new("run-1", "flow-1", "task", context);

        let output = action
            .execute(
                &json!({"title": "Call {{ name }}", "priority": "high", "slaHours": 4}),
                &ctx,
            )
            .await
            .unwrap();

        let tasks = storage.tasks_for_run("run-1").await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "Call Huda");
        assert_eq!(tasks[0].assignee.as_deref(), Some("rep-1"));
        assert_eq!(tasks[0].priority, TaskPriority::High);
        assert!(tasks[0].due_at.is_some());
        assert_eq!(output.context_updates().unwrap()["lastTaskId"], json!(tasks[0].id));
        assert_eq!(output.data["persisted"], true);
    }

    #[tokio::test]
    async fn test_rejects_bad_priority() {
        let action = CreateTaskAction::new(None);
        let ctx = ActionContext::new("run", "flow", "task", Map::new());
        let err = action
            .execute(&json!({"title": "x", "priority": "whenever"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_rejects_unrepresentable_sla() {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let action = CreateTaskAction::new(Some(storage.clone()));
        let ctx = ActionContext::new("run-2", "flow", "task", Map::new());
        let err = action
            .execute(&json!({"title": "x", "slaHours": 1e18}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(storage.tasks_for_run("run-2").await.unwrap().is_empty());
    }
}
