//! Tasks created by playbook runs and their SLA tracking.

mod sla;

pub use sla::SlaMonitor;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Overdue,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the lifecycle allows moving from `self` to `to`.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress | Cancelled | Overdue)
                | (InProgress, Completed | Failed | Cancelled | Overdue)
                | (Overdue, InProgress | Completed | Failed | Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Overdue => write!(f, "overdue"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "overdue" => Ok(Self::Overdue),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Urgent => write!(f, "urgent"),
        }
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            _ => Err(format!("Unknown task priority: {}", s)),
        }
    }
}

/// A unit of work for a person, usually created by a `create_task` action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub flow_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    /// SLA deadline
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: None,
            flow_id: None,
            title: title.into(),
            description: String::new(),
            assignee: None,
            priority: TaskPriority::default(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            due_at: None,
            completed_at: None,
        }
    }

    /// Attach an SLA deadline `hours` after creation.
    pub fn with_sla_hours(mut self, hours: f64) -> Result<Self> {
        let millis = hours * 3_600_000.0;
        let due_at = millis
            .is_finite()
            .then(|| ChronoDuration::try_milliseconds(millis.round() as i64))
            .flatten()
            .and_then(|d| self.created_at.checked_add_signed(d))
            .ok_or_else(|| Error::Config(format!("SLA of {} hours is out of range", hours)))?;
        self.due_at = Some(due_at);
        Ok(self)
    }

    /// Move to `to`, enforcing the lifecycle.
    pub fn transition(&mut self, to: TaskStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::Validation(vec![format!(
                "Task '{}' cannot move from {} to {}",
                self.id, self.status, to
            )]));
        }
        self.status = to;
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Open (non-terminal, not yet flagged) and past its deadline.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::InProgress)
            && self.due_at.map(|due| due <= now).unwrap_or(false)
    }
}

/// Flag every overdue task. Returns the ids that changed.
pub fn mark_overdue(tasks: &mut [Task], now: DateTime<Utc>) -> Vec<String> {
    let mut changed = Vec::new();
    for task in tasks.iter_mut() {
        if task.is_overdue(now) && task.transition(TaskStatus::Overdue, now).is_ok() {
            changed.push(task.id.clone());
        }
    }
    changed
}
