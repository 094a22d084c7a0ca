//! SQLite storage implementation.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::models::*;
use super::{FlowStore, RunStore, TaskStore};
use crate::error::{Error, Result};
use crate::tasks::{Task, TaskPriority, TaskStatus};

/// Parse an RFC 3339 datetime string into a `chrono::DateTime<Utc>`.
///
/// Returns a `rusqlite::Error` on parse failure instead of panicking,
/// so it is safe to use inside `query_row` / `query_map` closures.
fn parse_datetime_utc(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_optional_datetime(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_datetime_utc).transpose()
}

/// Fixed-width timestamps so that text comparison in SQL is chronological.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_enum<T: std::str::FromStr<Err = String>>(idx: usize, s: &str) -> rusqlite::Result<T> {
    s.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(Error::Storage(e)),
        )
    })
}

fn json_map(s: &str) -> Map<String, Value> {
    match serde_json::from_str(s) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Default query limit.
const DEFAULT_QUERY_LIMIT: usize = 50;
/// Maximum query limit to prevent abuse.
const MAX_QUERY_LIMIT: usize = 1000;

const RUN_COLUMNS: &str = "id, flow_id, flow_name, status, trigger_node, current_node, context, node_outputs, wake_at, active_ms, flow_retries, error, error_code, version, started_at, updated_at, finished_at";

const TASK_COLUMNS: &str = "id, run_id, flow_id, title, description, assignee, priority, status, created_at, due_at, completed_at";

/// SQLite-based storage.
#[derive(Clone)]
pub struct SqliteStorage {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;

        // Initialize schema synchronously before wrapping in async mutex
        Self::init_schema_sync(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema_sync(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema_sync(conn: &Connection) -> Result<()> {
        // WAL mode must be set before any transaction begins
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS flows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                definition TEXT NOT NULL,
                active INTEGER DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS flow_runs (
                id TEXT PRIMARY KEY,
                flow_id TEXT NOT NULL,
                flow_name TEXT NOT NULL,
                status TEXT NOT NULL,
                trigger_node TEXT NOT NULL,
                current_node TEXT,
                context TEXT NOT NULL,
                node_outputs TEXT NOT NULL,
                wake_at TEXT,
                active_ms INTEGER NOT NULL DEFAULT 0,
                flow_retries INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                error_code TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                finished_at TEXT
            );

            CREATE TABLE IF NOT EXISTS run_steps (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                node_type TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                output TEXT,
                error TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                FOREIGN KEY (run_id) REFERENCES flow_runs(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                run_id TEXT,
                flow_id TEXT,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                assignee TEXT,
                priority TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                due_at TEXT,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_flow_runs_flow ON flow_runs(flow_id, started_at DESC);
            CREATE INDEX IF NOT EXISTS idx_flow_runs_wake ON flow_runs(status, wake_at);
            CREATE INDEX IF NOT EXISTS idx_run_steps_run ON run_steps(run_id, started_at);
            CREATE INDEX IF NOT EXISTS idx_tasks_run ON tasks(run_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(status, due_at);
            "#,
        )?;
        Ok(())
    }

    pub async fn check_health(&self) -> Result<DatabaseHealth> {
        let conn = self.conn.lock().await;
        let integrity_check: String =
            conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        let busy_timeout_ms: i64 = conn.query_row("PRAGMA busy_timeout", [], |row| row.get(0))?;

        Ok(DatabaseHealth {
            integrity_check,
            journal_mode,
            busy_timeout_ms,
        })
    }

    pub async fn get_run_trace(&self, run_id: &str) -> Result<Option<RunTrace>> {
        let Some(run) = self.get_run(run_id).await? else {
            return Ok(None);
        };
        let steps = self.get_steps(run_id).await?;
        Ok(Some(RunTrace { run, steps }))
    }

    fn row_to_flow(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredFlow> {
        Ok(StoredFlow {
            id: row.get(0)?,
            name: row.get(1)?,
            definition: row.get(2)?,
            active: row.get(3)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(4)?)?,
            updated_at: parse_datetime_utc(&row.get::<_, String>(5)?)?,
        })
    }

    fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<FlowRun> {
        let status: String = row.get(3)?;
        let context: String = row.get(6)?;
        let node_outputs: String = row.get(7)?;
        let active_ms: i64 = row.get(9)?;

        Ok(FlowRun {
            id: row.get(0)?,
            flow_id: row.get(1)?,
            flow_name: row.get(2)?,
            status: parse_enum(3, &status)?,
            trigger_node: row.get(4)?,
            current_node: row.get(5)?,
            context: json_map(&context),
            node_outputs: json_map(&node_outputs),
            wake_at: parse_optional_datetime(row.get(8)?)?,
            active_ms: active_ms.max(0) as u64,
            flow_retries: row.get(10)?,
            error: row.get(11)?,
            error_code: row.get(12)?,
            version: row.get(13)?,
            started_at: parse_datetime_utc(&row.get::<_, String>(14)?)?,
            updated_at: parse_datetime_utc(&row.get::<_, String>(15)?)?,
            finished_at: parse_optional_datetime(row.get(16)?)?,
        })
    }

    fn row_to_step(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunStep> {
        let status: String = row.get(4)?;
        let output: Option<String> = row.get(6)?;

        Ok(RunStep {
            id: row.get(0)?,
            run_id: row.get(1)?,
            node_id: row.get(2)?,
            node_type: row.get(3)?,
            status: parse_enum(4, &status)?,
            attempts: row.get(5)?,
            output: output.and_then(|s| serde_json::from_str(&s).ok()),
            error: row.get(7)?,
            started_at: parse_datetime_utc(&row.get::<_, String>(8)?)?,
            finished_at: parse_optional_datetime(row.get(9)?)?,
        })
    }

    fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
        let priority: String = row.get(6)?;
        let status: String = row.get(7)?;

        Ok(Task {
            id: row.get(0)?,
            run_id: row.get(1)?,
            flow_id: row.get(2)?,
            title: row.get(3)?,
            description: row.get(4)?,
            assignee: row.get(5)?,
            priority: parse_enum::<TaskPriority>(6, &priority)?,
            status: parse_enum::<TaskStatus>(7, &status)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(8)?)?,
            due_at: parse_optional_datetime(row.get(9)?)?,
            completed_at: parse_optional_datetime(row.get(10)?)?,
        })
    }
}

// ============================================================================
// Flow operations
// ============================================================================

#[async_trait]
impl FlowStore for SqliteStorage {
    /// Insert or replace by name; the original id and creation time are kept.
    async fn save_flow(&self, flow: &StoredFlow) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO flows (id, name, definition, active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(name) DO UPDATE SET
                definition = excluded.definition,
                active = excluded.active,
                updated_at = excluded.updated_at",
            params![
                flow.id,
                flow.name,
                flow.definition,
                flow.active,
                format_datetime(&flow.created_at),
                format_datetime(&flow.updated_at),
            ],
        )?;
        Ok(())
    }

    async fn get_flow(&self, name: &str) -> Result<Option<StoredFlow>> {
        let conn = self.conn.lock().await;
        let flow = conn
            .query_row(
                "SELECT id, name, definition, active, created_at, updated_at
                 FROM flows WHERE name = ?1",
                [name],
                Self::row_to_flow,
            )
            .optional()?;
        Ok(flow)
    }

    async fn get_flow_by_id(&self, id: &str) -> Result<Option<StoredFlow>> {
        let conn = self.conn.lock().await;
        let flow = conn
            .query_row(
                "SELECT id, name, definition, active, created_at, updated_at
                 FROM flows WHERE id = ?1",
                [id],
                Self::row_to_flow,
            )
            .optional()?;
        Ok(flow)
    }

    async fn list_flows(&self) -> Result<Vec<StoredFlow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, definition, active, created_at, updated_at
             FROM flows ORDER BY name",
        )?;
        let flows = stmt
            .query_map([], Self::row_to_flow)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(flows)
    }

    async fn delete_flow(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute("DELETE FROM flows WHERE name = ?1", [name])?;
        if deleted == 0 {
            return Err(Error::NotFound(format!("Flow '{}'", name)));
        }
        Ok(())
    }
}

// ============================================================================
// Run operations
// ============================================================================

#[async_trait]
impl RunStore for SqliteStorage {
    async fn create_run(&self, run: &FlowRun) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO flow_runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                RUN_COLUMNS
            ),
            params![
                run.id,
                run.flow_id,
                run.flow_name,
                run.status.to_string(),
                run.trigger_node,
                run.current_node,
                serde_json::to_string(&run.context)?,
                serde_json::to_string(&run.node_outputs)?,
                run.wake_at.as_ref().map(format_datetime),
                run.active_ms as i64,
                run.flow_retries,
                run.error,
                run.error_code,
                run.version,
                format_datetime(&run.started_at),
                format_datetime(&run.updated_at),
                run.finished_at.as_ref().map(format_datetime),
            ],
        )?;
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Option<FlowRun>> {
        let conn = self.conn.lock().await;
        let run = conn
            .query_row(
                &format!("SELECT {} FROM flow_runs WHERE id = ?1", RUN_COLUMNS),
                [id],
                Self::row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    async fn update_run(&self, run: &mut FlowRun) -> Result<()> {
        let conn = self.conn.lock().await;
        let updated_at = Utc::now();
        let changed = conn.execute(
            "UPDATE flow_runs SET
                status = ?1, current_node = ?2, context = ?3, node_outputs = ?4,
                wake_at = ?5, active_ms = ?6, flow_retries = ?7, error = ?8,
                error_code = ?9, updated_at = ?10, finished_at = ?11,
                version = version + 1
             WHERE id = ?12 AND version = ?13",
            params![
                run.status.to_string(),
                run.current_node,
                serde_json::to_string(&run.context)?,
                serde_json::to_string(&run.node_outputs)?,
                run.wake_at.as_ref().map(format_datetime),
                run.active_ms as i64,
                run.flow_retries,
                run.error,
                run.error_code,
                format_datetime(&updated_at),
                run.finished_at.as_ref().map(format_datetime),
                run.id,
                run.version,
            ],
        )?;

        if changed == 0 {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT version FROM flow_runs WHERE id = ?1",
                    [run.id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(match exists {
                Some(stored) => Error::Conflict(format!(
                    "Run '{}' is at version {}, update was based on {}",
                    run.id, stored, run.version
                )),
                None => Error::NotFound(format!("Run '{}'", run.id)),
            });
        }

        run.version += 1;
        run.updated_at = updated_at;
        Ok(())
    }

    async fn query_runs(&self, query: &RunQuery) -> Result<Vec<FlowRun>> {
        let conn = self.conn.lock().await;

        let mut sql = format!("SELECT {} FROM flow_runs WHERE 1=1", RUN_COLUMNS);
        let mut bind: Vec<SqlValue> = Vec::new();

        if let Some(flow_id) = &query.flow_id {
            sql.push_str(" AND flow_id = ?");
            bind.push(SqlValue::Text(flow_id.clone()));
        }

        if let Some(status) = &query.status {
            sql.push_str(" AND status = ?");
            bind.push(SqlValue::Text(status.to_string()));
        }

        sql.push_str(" ORDER BY started_at DESC LIMIT ? OFFSET ?");
        let limit = if query.limit == 0 {
            DEFAULT_QUERY_LIMIT
        } else {
            query.limit.min(MAX_QUERY_LIMIT)
        };
        bind.push(SqlValue::Integer(limit as i64));
        bind.push(SqlValue::Integer(query.offset as i64));

        let mut stmt = conn.prepare(&sql)?;
        let runs = stmt
            .query_map(params_from_iter(bind.iter()), Self::row_to_run)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    async fn due_runs(&self, now: DateTime<Utc>) -> Result<Vec<FlowRun>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM flow_runs
             WHERE status = 'waiting' AND wake_at IS NOT NULL AND wake_at <= ?1
             ORDER BY wake_at",
            RUN_COLUMNS
        ))?;
        let runs = stmt
            .query_map([format_datetime(&now)], Self::row_to_run)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    async fn runs_in_status(&self, status: RunStatus) -> Result<Vec<FlowRun>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM flow_runs WHERE status = ?1 ORDER BY started_at",
            RUN_COLUMNS
        ))?;
        let runs = stmt
            .query_map([status.to_string()], Self::row_to_run)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    async fn save_step(&self, step: &RunStep) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO run_steps
             (id, run_id, node_id, node_type, status, attempts, output, error, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                attempts = excluded.attempts,
                output = excluded.output,
                error = excluded.error,
                finished_at = excluded.finished_at",
            params![
                step.id,
                step.run_id,
                step.node_id,
                step.node_type,
                step.status.to_string(),
                step.attempts,
                step.output.as_ref().map(|o| o.to_string()),
                step.error,
                format_datetime(&step.started_at),
                step.finished_at.as_ref().map(format_datetime),
            ],
        )?;
        Ok(())
    }

    async fn get_steps(&self, run_id: &str) -> Result<Vec<RunStep>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, node_id, node_type, status, attempts, output, error, started_at, finished_at
             FROM run_steps WHERE run_id = ?1 ORDER BY started_at, rowid",
        )?;
        let steps = stmt
            .query_map([run_id], Self::row_to_step)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(steps)
    }
}

// ============================================================================
// Task operations
// ============================================================================

#[async_trait]
impl TaskStore for SqliteStorage {
    async fn save_task(&self, task: &Task) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    description = excluded.description,
                    assignee = excluded.assignee,
                    priority = excluded.priority,
                    status = excluded.status,
                    due_at = excluded.due_at,
                    completed_at = excluded.completed_at",
                TASK_COLUMNS
            ),
            params![
                task.id,
                task.run_id,
                task.flow_id,
                task.title,
                task.description,
                task.assignee,
                task.priority.to_string(),
                task.status.to_string(),
                format_datetime(&task.created_at),
                task.due_at.as_ref().map(format_datetime),
                task.completed_at.as_ref().map(format_datetime),
            ],
        )?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.conn.lock().await;
        let task = conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                [id],
                Self::row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    async fn tasks_for_run(&self, run_id: &str) -> Result<Vec<Task>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE run_id = ?1 ORDER BY created_at",
            TASK_COLUMNS
        ))?;
        let tasks = stmt
            .query_map([run_id], Self::row_to_task)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    async fn overdue_candidates(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks
             WHERE status IN ('pending', 'in_progress') AND due_at IS NOT NULL AND due_at <= ?1
             ORDER BY due_at",
            TASK_COLUMNS
        ))?;
        let tasks = stmt
            .query_map([format_datetime(&now)], Self::row_to_task)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tasks)
    }
}
