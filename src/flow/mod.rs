//! Playbook flow graph: types, mutations, validation and import/export.

mod codec;
mod graph;
mod types;
mod validator;

pub use codec::{export_flow, import_flow, import_flow_file, EXPORT_VERSION};
pub use graph::NodeUpdate;
pub use types::{
    FailureStrategy, FlowSettings, NodeData, NodeStatus, NodeType, PlaybookConnection,
    PlaybookFlow, PlaybookNode, Position,
};
pub use validator::{reachable_from_triggers, validate, ValidationIssue, ValidationReport};
