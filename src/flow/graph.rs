//! Structural mutations and queries over a flow.
//!
//! Every mutation keeps referential integrity: no connection can point at a
//! node that is not in the flow once the call returns.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use super::types::{NodeStatus, NodeType, PlaybookConnection, PlaybookFlow, PlaybookNode, Position};
use crate::conditions::Guard;
use crate::error::{Error, Result};

/// Partial update applied by [`PlaybookFlow::update_node`]. The node type is
/// immutable.
#[derive(Debug, Clone, Default)]
pub struct NodeUpdate {
    pub label: Option<String>,
    pub config: Option<Value>,
    pub status: Option<NodeStatus>,
    pub position: Option<Position>,
}

impl PlaybookFlow {
    pub fn node(&self, id: &str) -> Option<&PlaybookNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn connection(&self, id: &str) -> Option<&PlaybookConnection> {
        self.connections.iter().find(|c| c.id == id)
    }

    /// Id index over the nodes.
    pub fn node_index(&self) -> HashMap<&str, &PlaybookNode> {
        self.nodes.iter().map(|n| (n.id.as_str(), n)).collect()
    }

    /// Outgoing connections of a node, in declaration order.
    pub fn outgoing(&self, node_id: &str) -> Vec<&PlaybookConnection> {
        self.connections
            .iter()
            .filter(|c| c.source == node_id)
            .collect()
    }

    pub fn incoming(&self, node_id: &str) -> Vec<&PlaybookConnection> {
        self.connections
            .iter()
            .filter(|c| c.target == node_id)
            .collect()
    }

    pub fn triggers(&self) -> Vec<&PlaybookNode> {
        self.nodes_of(NodeType::Trigger)
    }

    pub fn ends(&self) -> Vec<&PlaybookNode> {
        self.nodes_of(NodeType::End)
    }

    pub fn nodes_of(&self, node_type: NodeType) -> Vec<&PlaybookNode> {
        self.nodes
            .iter()
            .filter(|n| n.node_type == node_type)
            .collect()
    }

    /// Node types present in the flow.
    pub fn node_types(&self) -> HashSet<NodeType> {
        self.nodes.iter().map(|n| n.node_type).collect()
    }

    pub fn add_node(&mut self, node: PlaybookNode) -> Result<()> {
        if node.id.trim().is_empty() {
            return Err(Error::Graph("Node id cannot be empty".to_string()));
        }
        if self.node(&node.id).is_some() {
            return Err(Error::Graph(format!("Duplicate node id: {}", node.id)));
        }
        self.nodes.push(node);
        Ok(())
    }

    /// Remove a node together with every connection touching it.
    pub fn remove_node(&mut self, id: &str) -> Result<PlaybookNode> {
        let position = self
            .nodes
            .iter()
            .position(|n| n.id == id)
            .ok_or_else(|| Error::NotFound(format!("Node '{}'", id)))?;

        let node = self.nodes.remove(position);
        self.connections
            .retain(|c| c.source != node.id && c.target != node.id);
        Ok(node)
    }

    pub fn update_node(&mut self, id: &str, update: NodeUpdate) -> Result<&PlaybookNode> {
        let node = self
            .nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| Error::NotFound(format!("Node '{}'", id)))?;

        if let Some(label) = update.label {
            node.data.label = label;
        }
        if let Some(config) = update.config {
            node.data.config = config;
        }
        if let Some(status) = update.status {
            node.data.status = status;
        }
        if let Some(position) = update.position {
            node.position = position;
        }
        Ok(node)
    }

    pub fn add_connection(&mut self, connection: PlaybookConnection) -> Result<()> {
        if self.connection(&connection.id).is_some() {
            return Err(Error::Graph(format!(
                "Duplicate connection id: {}",
                connection.id
            )));
        }

        let source = self.node(&connection.source).ok_or_else(|| {
            Error::Graph(format!("Unknown source node: {}", connection.source))
        })?;
        if self.node(&connection.target).is_none() {
            return Err(Error::Graph(format!(
                "Unknown target node: {}",
                connection.target
            )));
        }
        if source.node_type == NodeType::End {
            return Err(Error::Graph(format!(
                "End node '{}' cannot have outgoing connections",
                source.id
            )));
        }

        if self
            .outgoing(&connection.source)
            .into_iter()
            .any(|c| c.target == connection.target && !exclusive_guards(c, &connection))
        {
            return Err(Error::Graph(format!(
                "Connection {} -> {} already exists",
                connection.source, connection.target
            )));
        }

        self.connections.push(connection);
        Ok(())
    }

    pub fn remove_connection(&mut self, id: &str) -> Result<PlaybookConnection> {
        let position = self
            .connections
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| Error::NotFound(format!("Connection '{}'", id)))?;
        Ok(self.connections.remove(position))
    }
}

/// Two parallel edges may coexist only when their guards provably exclude
/// each other. Unguarded or unparseable guards never do.
pub(crate) fn exclusive_guards(a: &PlaybookConnection, b: &PlaybookConnection) -> bool {
    let (Some(x), Some(y)) = (a.guard(), b.guard()) else {
        return false;
    };
    match (Guard::parse(x), Guard::parse(y)) {
        (Ok(x), Ok(y)) => x.excludes(&y),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> PlaybookFlow {
        let mut flow = PlaybookFlow::new("f", "Sample");
        flow.add_node(PlaybookNode::new("t", NodeType::Trigger, "Start")).unwrap();
        flow.add_node(PlaybookNode::new("c", NodeType::Condition, "Hot?")).unwrap();
        flow.add_node(PlaybookNode::new("a", NodeType::Action, "Call")).unwrap();
        flow.add_node(PlaybookNode::new("e", NodeType::End, "Done")).unwrap();
        flow.add_connection(PlaybookConnection::new("c1", "t", "c")).unwrap();
        flow.add_connection(PlaybookConnection::new("c2", "c", "a").guarded("true")).unwrap();
        flow.add_connection(PlaybookConnection::new("c3", "c", "e").guarded("false")).unwrap();
        flow.add_connection(PlaybookConnection::new("c4", "a", "e")).unwrap();
        flow
    }

    #[test]
    fn test_remove_node_cascades() {
        let mut flow = sample();
        let removed = flow.remove_node("c").unwrap();

        assert_eq!(removed.id, "c");
        assert_eq!(flow.connections.len(), 1);
        assert!(flow
            .connections
            .iter()
            .all(|c| flow.node(&c.source).is_some() && flow.node(&c.target).is_some()));
    }

    #[test]
    fn test_remove_missing_node() {
        let mut flow = sample();
        assert!(matches!(flow.remove_node("zzz"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let mut flow = sample();
        let err = flow
            .add_node(PlaybookNode::new("a", NodeType::Action, "Again"))
            .unwrap_err();
        assert!(matches!(err, Error::Graph(_)));
    }

    #[test]
    fn test_connection_endpoints_must_exist() {
        let mut flow = sample();
        assert!(flow
            .add_connection(PlaybookConnection::new("x", "t", "ghost"))
            .is_err());
        assert!(flow
            .add_connection(PlaybookConnection::new("x", "ghost", "t"))
            .is_err());
    }

    #[test]
    fn test_end_nodes_have_no_outgoing() {
        let mut flow = sample();
        let err = flow
            .add_connection(PlaybookConnection::new("x", "e", "a"))
            .unwrap_err();
        assert!(matches!(err, Error::Graph(_)));
    }

    #[test]
    fn test_parallel_edges_need_exclusive_guards() {
        let mut flow = sample();
        assert!(flow
            .add_connection(PlaybookConnection::new("dup", "a", "e"))
            .is_err());
        assert!(flow
            .add_connection(PlaybookConnection::new("dup", "c", "a").guarded("true"))
            .is_err());
        // A label and an expression may both hold
        assert!(flow
            .add_connection(PlaybookConnection::new("dup", "c", "a").guarded("score > 90"))
            .is_err());

        flow.add_node(PlaybookNode::new("x", NodeType::Action, "Email")).unwrap();
        flow.add_connection(PlaybookConnection::new("h", "c", "x").guarded("score > 50"))
            .unwrap();
        assert!(flow
            .add_connection(PlaybookConnection::new("h2", "c", "x").guarded("score > 60"))
            .is_err());
        assert!(flow
            .add_connection(PlaybookConnection::new("l", "c", "x").guarded("score <= 50"))
            .is_ok());
    }

    #[test]
    fn test_update_node_patches_fields() {
        let mut flow = sample();
        let node = flow
            .update_node(
                "a",
                NodeUpdate {
                    label: Some("Send WhatsApp".into()),
                    config: Some(json!({"action": "send_message"})),
                    ..NodeUpdate::default()
                },
            )
            .unwrap();

        assert_eq!(node.data.label, "Send WhatsApp");
        assert_eq!(node.node_type, NodeType::Action);
        assert_eq!(node.data.config["action"], "send_message");
    }

    #[test]
    fn test_queries() {
        let mut flow = sample();
        assert_eq!(flow.outgoing("c").len(), 2);
        assert_eq!(flow.incoming("e").len(), 2);
        assert_eq!(flow.triggers().len(), 1);
        assert_eq!(flow.ends().len(), 1);
        assert!(flow.node_types().contains(&NodeType::Condition));
        assert!(flow.remove_connection("c4").is_ok());
        assert_eq!(flow.connection("c4"), None);
    }
}
