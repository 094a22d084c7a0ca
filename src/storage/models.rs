//! Storage models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, ErrorRecord, Result};
use crate::flow::PlaybookFlow;

/// Stored flow record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFlow {
    pub id: String,
    pub name: String,
    pub definition: String, // JSON
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredFlow {
    pub fn from_flow(flow: &PlaybookFlow, active: bool) -> Result<Self> {
        let now = Utc::now();
        Ok(Self {
            id: flow.id.clone(),
            name: flow.name.clone(),
            definition: serde_json::to_string(flow)?,
            active,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn flow(&self) -> Result<PlaybookFlow> {
        serde_json::from_str(&self.definition)
            .map_err(|e| Error::Storage(format!("Corrupt definition for flow '{}': {}", self.name, e)))
    }
}

/// Run lifecycle state.
///
/// `Waiting` is a running run parked at a delay node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    PendingTrigger,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PendingTrigger => write!(f, "pending_trigger"),
            Self::Running => write!(f, "running"),
            Self::Waiting => write!(f, "waiting"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending_trigger" => Ok(Self::PendingTrigger),
            "running" => Ok(Self::Running),
            "waiting" => Ok(Self::Waiting),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

/// One execution of a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRun {
    pub id: String,
    pub flow_id: String,
    pub flow_name: String,
    pub status: RunStatus,
    pub trigger_node: String,
    /// Node the driver executes next, or the delay node while waiting
    pub current_node: Option<String>,
    pub context: Map<String, Value>,
    pub node_outputs: Map<String, Value>,
    pub wake_at: Option<DateTime<Utc>>,
    /// Active (non-suspended) time consumed so far, for reporting
    pub active_ms: u64,
    pub flow_retries: u32,
    pub error: Option<String>,
    pub error_code: Option<String>,
    /// Optimistic concurrency token
    pub version: i64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl FlowRun {
    pub fn new(flow: &PlaybookFlow, trigger_node: &str, context: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            flow_id: flow.id.clone(),
            flow_name: flow.name.clone(),
            status: RunStatus::PendingTrigger,
            trigger_node: trigger_node.to_string(),
            current_node: Some(trigger_node.to_string()),
            context,
            node_outputs: Map::new(),
            wake_at: None,
            active_ms: 0,
            flow_retries: 0,
            error: None,
            error_code: None,
            version: 0,
            started_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Record a failure and close the run.
    pub fn fail(&mut self, error: &Error, node_id: Option<&str>) {
        let record = ErrorRecord::from_error(error, node_id);
        self.status = RunStatus::Failed;
        self.error = Some(record.message);
        self.error_code = Some(record.code);
        if let Some(node_id) = node_id {
            self.current_node = Some(node_id.to_string());
        }
        self.wake_at = None;
        self.finished_at = Some(Utc::now());
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.wake_at = None;
        self.finished_at = Some(Utc::now());
    }
}

/// Outcome of a single node visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    Skipped,
    Waiting,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Waiting => write!(f, "waiting"),
        }
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "waiting" => Ok(Self::Waiting),
            _ => Err(format!("Unknown step status: {}", s)),
        }
    }
}

/// Node visit record (for run traces).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStep {
    pub id: String,
    pub run_id: String,
    pub node_id: String,
    pub node_type: String,
    pub status: StepStatus,
    pub attempts: u32,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunStep {
    pub fn start(run_id: &str, node_id: &str, node_type: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            node_id: node_id.to_string(),
            node_type: node_type.to_string(),
            status: StepStatus::Completed,
            attempts: 0,
            output: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn complete(mut self, status: StepStatus, output: Option<Value>) -> Self {
        self.status = status;
        self.output = output;
        self.finished_at = Some(Utc::now());
        self
    }

    pub fn failed(mut self, error: &Error) -> Self {
        self.status = StepStatus::Failed;
        self.error = Some(error.to_string());
        self.finished_at = Some(Utc::now());
        self
    }
}

/// Full run trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTrace {
    pub run: FlowRun,
    pub steps: Vec<RunStep>,
}

/// Database health summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseHealth {
    pub integrity_check: String,
    pub journal_mode: String,
    pub busy_timeout_ms: i64,
}

/// Query filters for run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunQuery {
    pub flow_id: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for RunQuery {
    fn default() -> Self {
        Self {
            flow_id: None,
            status: None,
            limit: 50,
            offset: 0,
        }
    }
}
