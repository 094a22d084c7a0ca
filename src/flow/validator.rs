//! Static flow validation.
//!
//! Checks for:
//! - At least one node, one trigger and one end
//! - Reachability of every non-trigger node from some trigger
//! - Cycles that do not pass through a delay node
//! - Referential integrity, duplicate ids and parallel edges
//! - Outgoing-edge cardinality per node type
//!
//! Messages are the user-facing (Arabic) strings shown by the editor.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use serde::Serialize;

use super::graph::exclusive_guards;
use super::types::{NodeType, PlaybookFlow};
use crate::conditions::Guard;
use crate::error::{Error, Result};

/// A blocking problem found in a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationIssue {
    EmptyFlow,
    NoTrigger,
    NoEnd,
    Unreachable { count: usize },
    Cycle { nodes: Vec<String> },
    DanglingConnection { connection_id: String, node_id: String },
    DuplicateNodeId { node_id: String },
    DuplicateConnection { source: String, target: String },
    TooManyOutgoing { node_id: String, count: usize, max: usize },
    DefaultEdgeConflict { node_id: String },
    InvalidGuard { connection_id: String },
}

impl ValidationIssue {
    pub fn message(&self) -> String {
        match self {
            ValidationIssue::EmptyFlow => "يجب إضافة عقدة واحدة على الأقل إلى التدفق".to_string(),
            ValidationIssue::NoTrigger => "يجب وجود نقطة بداية واحدة على الأقل".to_string(),
            ValidationIssue::NoEnd => "يجب وجود نقطة نهاية واحدة على الأقل".to_string(),
            ValidationIssue::Unreachable { count } => {
                format!("توجد {} عقدة غير قابلة للوصول", count)
            }
            ValidationIssue::Cycle { nodes } => format!(
                "يحتوي التدفق على حلقة بدون عقدة تأخير: {}",
                nodes.join(" → ")
            ),
            ValidationIssue::DanglingConnection {
                connection_id,
                node_id,
            } => format!(
                "الاتصال {} يشير إلى عقدة غير موجودة: {}",
                connection_id, node_id
            ),
            ValidationIssue::DuplicateNodeId { node_id } => {
                format!("معرّف العقدة مكرر: {}", node_id)
            }
            ValidationIssue::DuplicateConnection { source, target } => format!(
                "يوجد أكثر من اتصال بين {} و {} بدون شروط متنافية",
                source, target
            ),
            ValidationIssue::TooManyOutgoing {
                node_id,
                count,
                max,
            } => format!(
                "العقدة {} لديها {} اتصالات صادرة والحد الأقصى {}",
                node_id, count, max
            ),
            ValidationIssue::DefaultEdgeConflict { node_id } => {
                format!("العقدة {} لديها أكثر من اتصال افتراضي", node_id)
            }
            ValidationIssue::InvalidGuard { connection_id } => {
                format!("شرط الاتصال {} غير صالح", connection_id)
            }
        }
    }
}

/// Outcome of [`validate`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub issues: Vec<ValidationIssue>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn from_issues(issues: Vec<ValidationIssue>, warnings: Vec<String>) -> Self {
        Self {
            is_valid: issues.is_empty(),
            errors: issues.iter().map(ValidationIssue::message).collect(),
            issues,
            warnings,
        }
    }

    pub fn has(&self, predicate: impl Fn(&ValidationIssue) -> bool) -> bool {
        self.issues.iter().any(predicate)
    }

    /// Gate for activation. Drafts can be saved regardless.
    pub fn into_result(self) -> Result<()> {
        if self.is_valid {
            Ok(())
        } else {
            Err(Error::Validation(self.errors))
        }
    }
}

/// Validate a flow. Never mutates it.
pub fn validate(flow: &PlaybookFlow) -> ValidationReport {
    let mut issues = Vec::new();
    let mut warnings = Vec::new();

    if flow.nodes.is_empty() {
        issues.push(ValidationIssue::EmptyFlow);
    }
    if !flow.nodes.iter().any(|n| n.node_type == NodeType::Trigger) {
        issues.push(ValidationIssue::NoTrigger);
    }
    if !flow.nodes.iter().any(|n| n.node_type == NodeType::End) {
        issues.push(ValidationIssue::NoEnd);
    }

    let mut seen = HashSet::new();
    for node in &flow.nodes {
        if !seen.insert(node.id.as_str()) {
            issues.push(ValidationIssue::DuplicateNodeId {
                node_id: node.id.clone(),
            });
        }
    }

    for conn in &flow.connections {
        for endpoint in [&conn.source, &conn.target] {
            if !seen.contains(endpoint.as_str()) {
                issues.push(ValidationIssue::DanglingConnection {
                    connection_id: conn.id.clone(),
                    node_id: endpoint.clone(),
                });
            }
        }
        if let Some(guard) = conn.guard() {
            if Guard::parse(guard).is_err() {
                issues.push(ValidationIssue::InvalidGuard {
                    connection_id: conn.id.clone(),
                });
            }
        }
    }

    check_parallel_edges(flow, &mut issues);
    check_cardinality(flow, &mut issues, &mut warnings);

    if !flow.nodes.is_empty() {
        let reachable = reachable_from_triggers(flow);
        let unreachable = flow
            .nodes
            .iter()
            .filter(|n| n.node_type != NodeType::Trigger && !reachable.contains(n.id.as_str()))
            .count();
        if unreachable > 0 {
            issues.push(ValidationIssue::Unreachable { count: unreachable });
        }
    }

    for nodes in find_cycles(flow) {
        issues.push(ValidationIssue::Cycle { nodes });
    }

    ValidationReport::from_issues(issues, warnings)
}

fn check_parallel_edges(flow: &PlaybookFlow, issues: &mut Vec<ValidationIssue>) {
    let mut reported = HashSet::new();
    for (i, a) in flow.connections.iter().enumerate() {
        for b in &flow.connections[i + 1..] {
            if a.source == b.source
                && a.target == b.target
                && !exclusive_guards(a, b)
                && reported.insert((a.source.as_str(), a.target.as_str()))
            {
                issues.push(ValidationIssue::DuplicateConnection {
                    source: a.source.clone(),
                    target: a.target.clone(),
                });
            }
        }
    }
}

fn check_cardinality(
    flow: &PlaybookFlow,
    issues: &mut Vec<ValidationIssue>,
    warnings: &mut Vec<String>,
) {
    let mut checked = HashSet::new();
    for node in &flow.nodes {
        if !checked.insert(node.id.as_str()) {
            continue;
        }
        let outgoing = flow.outgoing(&node.id);

        if let Some(max) = node.node_type.max_outgoing() {
            if outgoing.len() > max {
                issues.push(ValidationIssue::TooManyOutgoing {
                    node_id: node.id.clone(),
                    count: outgoing.len(),
                    max,
                });
            }
        }

        if outgoing.iter().filter(|c| c.is_default_edge()).count() > 1 {
            issues.push(ValidationIssue::DefaultEdgeConflict {
                node_id: node.id.clone(),
            });
        }

        match node.node_type {
            NodeType::Action | NodeType::Delay | NodeType::Condition if outgoing.is_empty() => {
                warnings.push(format!("العقدة {} ليس لها اتصال صادر", node.id));
            }
            NodeType::Condition if outgoing.len() < 2 => {
                warnings.push(format!("عقدة الشرط {} يجب أن يكون لها فرعان على الأقل", node.id));
            }
            _ => {}
        }
    }
}

/// Ids of every node reachable (breadth-first) from any trigger, triggers
/// included.
pub fn reachable_from_triggers(flow: &PlaybookFlow) -> HashSet<&str> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for conn in &flow.connections {
        adjacency
            .entry(conn.source.as_str())
            .or_default()
            .push(conn.target.as_str());
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    for trigger in flow.triggers() {
        if visited.insert(trigger.id.as_str()) {
            queue.push_back(trigger.id.as_str());
        }
    }

    while let Some(current) = queue.pop_front() {
        for next in adjacency.get(current).into_iter().flatten() {
            if visited.insert(next) {
                queue.push_back(next);
            }
        }
    }
    visited
}

/// Cycles formed only by non-delay nodes, each reported once as a closed
/// path in traversal order.
fn find_cycles(flow: &PlaybookFlow) -> Vec<Vec<String>> {
    let types = flow.node_index();
    let non_delay = |id: &str| {
        types
            .get(id)
            .map(|n| n.node_type != NodeType::Delay)
            .unwrap_or(false)
    };

    let mut graph: HashMap<&str, Vec<&str>> = HashMap::new();
    for conn in &flow.connections {
        if non_delay(conn.source.as_str()) && non_delay(conn.target.as_str()) {
            graph
                .entry(conn.source.as_str())
                .or_default()
                .push(conn.target.as_str());
        }
    }

    let mut cycles = Vec::new();
    let mut seen_sets: HashSet<BTreeSet<&str>> = HashSet::new();
    let mut visited = HashSet::new();

    for node in &flow.nodes {
        let start = node.id.as_str();
        if visited.contains(start) || !non_delay(start) {
            continue;
        }

        // Iterative DFS keeping the current path on an explicit stack
        let mut path: Vec<&str> = vec![start];
        let mut on_path: HashSet<&str> = HashSet::from([start]);
        let mut cursors: Vec<usize> = vec![0];
        visited.insert(start);

        while let Some(&current) = path.last() {
            let depth = path.len() - 1;
            let neighbors = graph.get(current).map(Vec::as_slice).unwrap_or(&[]);

            if cursors[depth] >= neighbors.len() {
                on_path.remove(current);
                path.pop();
                cursors.pop();
                continue;
            }

            let next = neighbors[cursors[depth]];
            cursors[depth] += 1;

            if on_path.contains(next) {
                let from = path.iter().position(|n| *n == next).unwrap_or(0);
                let members: BTreeSet<&str> = path[from..].iter().copied().collect();
                if seen_sets.insert(members) {
                    let mut cycle: Vec<String> = path[from..].iter().map(|s| s.to_string()).collect();
                    cycle.push(next.to_string());
                    cycles.push(cycle);
                }
            } else if visited.insert(next) {
                path.push(next);
                on_path.insert(next);
                cursors.push(0);
            }
        }
    }
    cycles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::types::{PlaybookConnection, PlaybookNode};
    use proptest::prelude::*;

    fn node(id: &str, node_type: NodeType) -> PlaybookNode {
        PlaybookNode::new(id, node_type, id)
    }

    fn conn(id: &str, source: &str, target: &str) -> PlaybookConnection {
        PlaybookConnection::new(id, source, target)
    }

    fn linear() -> PlaybookFlow {
        let mut flow = PlaybookFlow::new("f", "Linear");
        flow.nodes = vec![
            node("t", NodeType::Trigger),
            node("a", NodeType::Action),
            node("e", NodeType::End),
        ];
        flow.connections = vec![conn("c1", "t", "a"), conn("c2", "a", "e")];
        flow
    }

    #[test]
    fn test_valid_linear_flow() {
        let report = validate(&linear());
        assert!(report.is_valid, "{:?}", report.errors);
        assert!(report.errors.is_empty());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_empty_flow() {
        let report = validate(&PlaybookFlow::new("f", "Empty"));
        assert!(!report.is_valid);
        assert_eq!(report.errors[0], "يجب إضافة عقدة واحدة على الأقل إلى التدفق");
        assert!(report.has(|i| *i == ValidationIssue::NoTrigger));
        assert!(report.has(|i| *i == ValidationIssue::NoEnd));
    }

    #[test]
    fn test_missing_end_node() {
        let mut flow = PlaybookFlow::new("f", "No end");
        flow.nodes = vec![node("t", NodeType::Trigger), node("a", NodeType::Action)];
        flow.connections = vec![conn("c1", "t", "a")];

        let report = validate(&flow);
        assert!(!report.is_valid);
        assert!(report
            .errors
            .contains(&"يجب وجود نقطة نهاية واحدة على الأقل".to_string()));
        assert!(!report.has(|i| *i == ValidationIssue::NoTrigger));
    }

    #[test]
    fn test_orphan_node_counted_once() {
        let mut flow = linear();
        flow.nodes.push(node("orphan", NodeType::Condition));

        let report = validate(&flow);
        assert!(!report.is_valid);
        let unreachable: Vec<_> = report
            .issues
            .iter()
            .filter(|i| matches!(i, ValidationIssue::Unreachable { .. }))
            .collect();
        assert_eq!(unreachable, vec![&ValidationIssue::Unreachable { count: 1 }]);
        assert!(report.errors.contains(&"توجد 1 عقدة غير قابلة للوصول".to_string()));
    }

    #[test]
    fn test_parallel_edges_with_overlapping_guards() {
        let mut flow = PlaybookFlow::new("f", "Parallel");
        flow.nodes = vec![
            node("t", NodeType::Trigger),
            node("c", NodeType::Condition),
            node("a", NodeType::Action),
            node("e", NodeType::End),
        ];
        flow.connections = vec![
            conn("1", "t", "c"),
            conn("2", "c", "a").guarded("score > 50"),
            conn("3", "c", "a").guarded("score <= 50"),
            conn("4", "a", "e"),
        ];
        let duplicate = |i: &ValidationIssue| matches!(i, ValidationIssue::DuplicateConnection { .. });
        assert!(!validate(&flow).has(duplicate));

        flow.connections[2] = conn("3", "c", "a").guarded("score > 60");
        assert!(validate(&flow).has(duplicate));
    }

    #[test]
    fn test_cycle_without_delay() {
        let mut flow = PlaybookFlow::new("f", "Loop");
        flow.nodes = vec![
            node("t", NodeType::Trigger),
            node("c", NodeType::Condition),
            node("a", NodeType::Action),
            node("e", NodeType::End),
        ];
        flow.connections = vec![
            conn("1", "t", "c"),
            conn("2", "c", "a").guarded("score > 50"),
            conn("3", "c", "e").guarded("score <= 50"),
            conn("4", "a", "c"),
        ];

        let report = validate(&flow);
        assert!(!report.is_valid);
        assert!(report.has(|i| matches!(i, ValidationIssue::Cycle { nodes } if nodes == &["c", "a", "c"])));
    }

    #[test]
    fn test_cycle_through_delay_is_allowed() {
        let mut flow = PlaybookFlow::new("f", "Follow-up loop");
        flow.nodes = vec![
            node("t", NodeType::Trigger),
            node("c", NodeType::Condition),
            node("a", NodeType::Action),
            node("d", NodeType::Delay),
            node("e", NodeType::End),
        ];
        flow.connections = vec![
            conn("1", "t", "c"),
            conn("2", "c", "a").guarded("true"),
            conn("3", "c", "e").guarded("false"),
            conn("4", "a", "d"),
            conn("5", "d", "c"),
        ];

        let report = validate(&flow);
        assert!(report.is_valid, "{:?}", report.errors);
    }

    #[test]
    fn test_structural_issues() {
        let mut flow = linear();
        flow.nodes.push(node("a", NodeType::Action));
        flow.connections.push(conn("c3", "a", "ghost"));
        flow.connections.push(conn("c4", "t", "a"));

        let report = validate(&flow);
        assert!(report.has(|i| matches!(i, ValidationIssue::DuplicateNodeId { node_id } if node_id == "a")));
        assert!(report.has(|i| matches!(i, ValidationIssue::DanglingConnection { node_id, .. } if node_id == "ghost")));
        assert!(report.has(|i| matches!(i, ValidationIssue::DuplicateConnection { source, .. } if source == "t")));
        assert!(report.has(|i| matches!(i, ValidationIssue::TooManyOutgoing { node_id, count: 2, max: 1 } if node_id == "a")));
    }

    #[test]
    fn test_default_edge_conflict() {
        let mut flow = linear();
        flow.nodes.push(node("c", NodeType::Condition));
        flow.connections[0] = conn("c1", "t", "c");
        flow.connections.push(conn("c3", "c", "a").as_default());
        flow.connections.push(conn("c4", "c", "e").as_default());

        let report = validate(&flow);
        assert!(report.has(|i| matches!(i, ValidationIssue::DefaultEdgeConflict { .. })));
    }

    #[test]
    fn test_invalid_guard() {
        let mut flow = linear();
        flow.connections[1] = conn("c2", "a", "e").guarded("score >");
        let report = validate(&flow);
        assert!(report.has(|i| matches!(i, ValidationIssue::InvalidGuard { .. })));
    }

    #[test]
    fn test_missing_outgoing_is_a_warning() {
        let mut flow = linear();
        flow.nodes.push(node("a2", NodeType::Action));
        flow.connections.push(conn("c3", "t", "a2"));

        let report = validate(&flow);
        assert!(report.is_valid);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_into_result() {
        let err = validate(&PlaybookFlow::new("f", "x")).into_result().unwrap_err();
        assert!(matches!(err, Error::Validation(errors) if errors.len() == 3));
        assert!(validate(&linear()).into_result().is_ok());
    }

    #[test]
    fn test_report_serializes_camel_case() {
        let value = serde_json::to_value(validate(&linear())).unwrap();
        assert_eq!(value["isValid"], true);
    }

    fn arb_flow() -> impl Strategy<Value = PlaybookFlow> {
        let types = prop::sample::select(vec![
            NodeType::Trigger,
            NodeType::Action,
            NodeType::Condition,
            NodeType::Delay,
            NodeType::End,
        ]);
        (
            prop::collection::vec(types, 1..10),
            prop::collection::vec((0usize..10, 0usize..10), 0..20),
        )
            .prop_map(|(types, edges)| {
                let mut flow = PlaybookFlow::new("p", "prop");
                for (i, t) in types.iter().enumerate() {
                    flow.nodes.push(node(&format!("n{}", i), *t));
                }
                let n = flow.nodes.len();
                for (i, (s, t)) in edges.into_iter().enumerate() {
                    flow.connections
                        .push(conn(&format!("c{}", i), &format!("n{}", s % n), &format!("n{}", t % n)));
                }
                flow
            })
    }

    /// Reachability by fixpoint iteration, independent of the BFS.
    fn naive_reachable(flow: &PlaybookFlow) -> HashSet<String> {
        let mut reached: HashSet<String> = flow.triggers().iter().map(|n| n.id.clone()).collect();
        loop {
            let before = reached.len();
            for c in &flow.connections {
                if reached.contains(&c.source) {
                    reached.insert(c.target.clone());
                }
            }
            if reached.len() == before {
                return reached;
            }
        }
    }

    proptest! {
        #[test]
        fn prop_reachability_partition(flow in arb_flow()) {
            let expected = naive_reachable(&flow);
            let actual: HashSet<String> = reachable_from_triggers(&flow).into_iter().map(String::from).collect();
            prop_assert_eq!(&actual, &expected);

            let unreachable = flow.nodes.iter()
                .filter(|n| n.node_type != NodeType::Trigger && !expected.contains(&n.id))
                .count();
            let report = validate(&flow);
            let reported = report.issues.iter().find_map(|i| match i {
                ValidationIssue::Unreachable { count } => Some(*count),
                _ => None,
            }).unwrap_or(0);
            prop_assert_eq!(reported, unreachable);
        }

        #[test]
        fn prop_trigger_and_end_checks(flow in arb_flow()) {
            let report = validate(&flow);
            let has_trigger = flow.nodes.iter().any(|n| n.node_type == NodeType::Trigger);
            let has_end = flow.nodes.iter().any(|n| n.node_type == NodeType::End);
            prop_assert_eq!(report.has(|i| *i == ValidationIssue::NoTrigger), !has_trigger);
            prop_assert_eq!(report.has(|i| *i == ValidationIssue::NoEnd), !has_end);
        }
    }
}
