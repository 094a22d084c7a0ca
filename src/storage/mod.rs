//! Storage layer for flows, runs and tasks.
//!
//! The engine only talks to the repository traits; [`SqliteStorage`]
//! implements all three.

mod models;
mod sqlite;

pub use models::*;
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::tasks::Task;

/// Flow definitions.
#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn save_flow(&self, flow: &StoredFlow) -> Result<()>;

    async fn get_flow(&self, name: &str) -> Result<Option<StoredFlow>>;

    async fn get_flow_by_id(&self, id: &str) -> Result<Option<StoredFlow>>;

    async fn list_flows(&self) -> Result<Vec<StoredFlow>>;

    async fn delete_flow(&self, name: &str) -> Result<()>;
}

/// Run state and traces.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a new run at version 0.
    async fn create_run(&self, run: &FlowRun) -> Result<()>;

    async fn get_run(&self, id: &str) -> Result<Option<FlowRun>>;

    /// Persist `run` if nobody else has written it since it was read.
    ///
    /// Bumps `run.version` on success; fails with `Error::Conflict` when the
    /// stored version moved on.
    async fn update_run(&self, run: &mut FlowRun) -> Result<()>;

    async fn query_runs(&self, query: &RunQuery) -> Result<Vec<FlowRun>>;

    /// Waiting runs whose wake-up time has passed.
    async fn due_runs(&self, now: DateTime<Utc>) -> Result<Vec<FlowRun>>;

    /// Every run currently in `status`.
    async fn runs_in_status(&self, status: RunStatus) -> Result<Vec<FlowRun>>;

    async fn save_step(&self, step: &RunStep) -> Result<()>;

    async fn get_steps(&self, run_id: &str) -> Result<Vec<RunStep>>;
}

/// Tasks created by runs.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn save_task(&self, task: &Task) -> Result<()>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>>;

    async fn tasks_for_run(&self, run_id: &str) -> Result<Vec<Task>>;

    /// Open tasks (pending / in progress) whose deadline has passed.
    async fn overdue_candidates(&self, now: DateTime<Utc>) -> Result<Vec<Task>>;
}
