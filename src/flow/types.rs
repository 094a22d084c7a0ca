//! Playbook flow type definitions.
//!
//! The JSON shape (camelCase) is the editor's import/export format.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Closed set of node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Trigger,
    Action,
    Condition,
    Delay,
    End,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Trigger => "trigger",
            NodeType::Action => "action",
            NodeType::Condition => "condition",
            NodeType::Delay => "delay",
            NodeType::End => "end",
        }
    }

    /// Maximum outgoing edges, if bounded.
    pub fn max_outgoing(&self) -> Option<usize> {
        match self {
            NodeType::Action | NodeType::Delay => Some(1),
            NodeType::End => Some(0),
            NodeType::Trigger | NodeType::Condition => None,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canvas position. Carried for the editor; ignored by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Idle,
    Active,
    Disabled,
    Error,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeData {
    #[serde(default)]
    pub label: String,

    /// Type-specific configuration
    #[serde(default)]
    pub config: Value,

    #[serde(default)]
    pub status: NodeStatus,
}

/// A node of the flow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookNode {
    pub id: String,

    #[serde(rename = "type")]
    pub node_type: NodeType,

    #[serde(default)]
    pub position: Position,

    #[serde(default)]
    pub data: NodeData,
}

impl PlaybookNode {
    pub fn new(id: &str, node_type: NodeType, label: &str) -> Self {
        Self {
            id: id.to_string(),
            node_type,
            position: Position::default(),
            data: NodeData {
                label: label.to_string(),
                ..NodeData::default()
            },
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.data.config = config;
        self
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.position = Position { x, y };
        self
    }

    pub fn is_disabled(&self) -> bool {
        self.data.status == NodeStatus::Disabled
    }
}

/// Directed edge, optionally guarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybookConnection {
    pub id: String,
    pub source: String,
    pub target: String,

    /// Guard expression or `true`/`false` branch label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_default: Option<bool>,
}

impl PlaybookConnection {
    pub fn new(id: &str, source: &str, target: &str) -> Self {
        Self {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            condition: None,
            is_default: None,
        }
    }

    pub fn guarded(mut self, condition: &str) -> Self {
        self.condition = Some(condition.to_string());
        self
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = Some(true);
        self
    }

    pub fn is_default_edge(&self) -> bool {
        self.is_default.unwrap_or(false)
    }

    /// Guard text, with blank guards treated as absent.
    pub fn guard(&self) -> Option<&str> {
        self.condition
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

/// What happens when an action exhausts its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStrategy {
    #[default]
    Stop,
    Continue,
    Retry,
}

/// Flow-wide execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSettings {
    /// Active run time bound in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Retries per action attempt
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    #[serde(default)]
    pub failure_strategy: FailureStrategy,

    #[serde(default = "default_true")]
    pub notification_enabled: bool,

    /// Flow-level retries when `failure_strategy` is `retry`
    #[serde(default = "default_max_flow_retries")]
    pub max_flow_retries: u32,
}

fn default_timeout() -> u64 {
    3600
}

fn default_retry_count() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_max_flow_retries() -> u32 {
    3
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            retry_count: default_retry_count(),
            failure_strategy: FailureStrategy::default(),
            notification_enabled: true,
            max_flow_retries: default_max_flow_retries(),
        }
    }
}

/// A complete playbook.
///
/// # Example JSON
///
/// ```json
/// {
///   "id": "welcome",
///   "name": "Welcome new leads",
///   "nodes": [
///     { "id": "t", "type": "trigger", "data": { "label": "Lead created", "config": { "event": "lead.created" } } },
///     { "id": "e", "type": "end", "data": { "label": "Done" } }
///   ],
///   "connections": [ { "id": "c1", "source": "t", "target": "e" } ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookFlow {
    pub id: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub nodes: Vec<PlaybookNode>,

    #[serde(default)]
    pub connections: Vec<PlaybookConnection>,

    /// Seed values copied into every run context
    #[serde(default)]
    pub variables: Map<String, Value>,

    #[serde(default)]
    pub settings: FlowSettings,
}

impl PlaybookFlow {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: None,
            nodes: Vec::new(),
            connections: Vec::new(),
            variables: Map::new(),
            settings: FlowSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_editor_shape() {
        let flow: PlaybookFlow = serde_json::from_value(json!({
            "id": "f1",
            "name": "Hot leads",
            "nodes": [
                {"id": "t", "type": "trigger", "position": {"x": 10, "y": 20},
                 "data": {"label": "Start", "config": {"event": "lead.created"}}},
                {"id": "e", "type": "end", "data": {"label": "End", "status": "active"}}
            ],
            "connections": [
                {"id": "c1", "source": "t", "target": "e", "isDefault": true}
            ],
            "settings": {"timeout": 60, "retryCount": 1, "failureStrategy": "continue"}
        }))
        .unwrap();

        assert_eq!(flow.nodes[0].node_type, NodeType::Trigger);
        assert_eq!(flow.nodes[0].position.y, 20.0);
        assert_eq!(flow.nodes[1].data.status, NodeStatus::Active);
        assert!(flow.connections[0].is_default_edge());
        assert_eq!(flow.settings.failure_strategy, FailureStrategy::Continue);
        assert!(flow.settings.notification_enabled);
        assert_eq!(flow.settings.max_flow_retries, 3);
    }

    #[test]
    fn test_connection_serializes_camel_case() {
        let conn = PlaybookConnection::new("c", "a", "b").as_default();
        let value = serde_json::to_value(&conn).unwrap();
        assert_eq!(value["isDefault"], true);
        assert!(value.get("condition").is_none());
    }

    #[test]
    fn test_blank_guard_is_absent() {
        let conn = PlaybookConnection::new("c", "a", "b").guarded("   ");
        assert_eq!(conn.guard(), None);
    }

    #[test]
    fn test_cardinality() {
        assert_eq!(NodeType::Action.max_outgoing(), Some(1));
        assert_eq!(NodeType::End.max_outgoing(), Some(0));
        assert_eq!(NodeType::Condition.max_outgoing(), None);
    }
}
