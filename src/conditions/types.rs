//! Condition tree types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Data a condition is evaluated against.
pub type Context = serde_json::Map<String, Value>;

/// Comparison operator of a leaf condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[default]
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
    GreaterEqual,
    LessEqual,
    In,
    NotIn,
    Empty,
    NotEmpty,
}

impl Operator {
    pub const ALL: [Operator; 12] = [
        Operator::Equals,
        Operator::NotEquals,
        Operator::Contains,
        Operator::NotContains,
        Operator::GreaterThan,
        Operator::LessThan,
        Operator::GreaterEqual,
        Operator::LessEqual,
        Operator::In,
        Operator::NotIn,
        Operator::Empty,
        Operator::NotEmpty,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Equals => "equals",
            Operator::NotEquals => "not_equals",
            Operator::Contains => "contains",
            Operator::NotContains => "not_contains",
            Operator::GreaterThan => "greater_than",
            Operator::LessThan => "less_than",
            Operator::GreaterEqual => "greater_equal",
            Operator::LessEqual => "less_equal",
            Operator::In => "in",
            Operator::NotIn => "not_in",
            Operator::Empty => "empty",
            Operator::NotEmpty => "not_empty",
        }
    }

    /// `empty` / `not_empty` look only at the context value.
    pub fn ignores_value(&self) -> bool {
        matches!(self, Operator::Empty | Operator::NotEmpty)
    }

    pub fn is_ordering(&self) -> bool {
        matches!(
            self,
            Operator::GreaterThan
                | Operator::LessThan
                | Operator::GreaterEqual
                | Operator::LessEqual
        )
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operator::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| format!("Unknown operator: {}", s))
    }
}

/// How a leaf condition is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    /// Compare a registry field against a value.
    #[default]
    Field,
    /// Sandboxed script over `data` and `user`.
    Script,
    /// Remote HTTP check.
    Api,
    /// Classification model with a confidence threshold.
    Ai,
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConditionKind::Field => "field",
            ConditionKind::Script => "script",
            ConditionKind::Api => "api",
            ConditionKind::Ai => "ai",
        };
        f.write_str(name)
    }
}

/// A leaf condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(default)]
    pub id: String,

    /// Field name from the registry (ignored by script/api/ai kinds)
    #[serde(default)]
    pub field: String,

    #[serde(default)]
    pub operator: Operator,

    #[serde(default)]
    pub value: Value,

    #[serde(rename = "type", default)]
    pub kind: ConditionKind,

    /// Kind-specific settings (script source, URL, threshold, ...)
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
}

impl Condition {
    /// Field comparison condition.
    pub fn field(field: &str, operator: Operator, value: Value) -> Self {
        Self {
            id: String::new(),
            field: field.to_string(),
            operator,
            value,
            kind: ConditionKind::Field,
            config: Value::Null,
        }
    }

    /// External condition of the given kind.
    pub fn external(kind: ConditionKind, config: Value) -> Self {
        Self {
            id: String::new(),
            field: String::new(),
            operator: Operator::Equals,
            value: Value::Null,
            kind,
            config,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }
}

/// Boolean combinator of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Logic {
    #[default]
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

/// Recursive AND/OR tree of conditions. Children are owned.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConditionGroup {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub logic: Logic,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<ConditionGroup>,
}

impl ConditionGroup {
    pub fn new(logic: Logic) -> Self {
        Self {
            logic,
            ..Self::default()
        }
    }

    pub fn and(conditions: Vec<Condition>) -> Self {
        Self {
            logic: Logic::And,
            conditions,
            ..Self::default()
        }
    }

    pub fn or(conditions: Vec<Condition>) -> Self {
        Self {
            logic: Logic::Or,
            conditions,
            ..Self::default()
        }
    }

    pub fn with_group(mut self, group: ConditionGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty() && self.groups.is_empty()
    }

    /// Nesting depth; a group without child groups has depth 1.
    pub fn depth(&self) -> usize {
        let mut max = 0;
        let mut stack = vec![(self, 1usize)];
        while let Some((group, depth)) = stack.pop() {
            max = max.max(depth);
            for child in &group.groups {
                stack.push((child, depth + 1));
            }
        }
        max
    }
}

/// Anything the evaluator accepts: a single condition or a group.
#[derive(Debug, Clone, Copy)]
pub enum ConditionRef<'a> {
    Condition(&'a Condition),
    Group(&'a ConditionGroup),
}

impl<'a> From<&'a Condition> for ConditionRef<'a> {
    fn from(condition: &'a Condition) -> Self {
        ConditionRef::Condition(condition)
    }
}

impl<'a> From<&'a ConditionGroup> for ConditionRef<'a> {
    fn from(group: &'a ConditionGroup) -> Self {
        ConditionRef::Group(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_condition_json_shape() {
        let condition: Condition = serde_json::from_value(json!({
            "id": "c1",
            "field": "score",
            "operator": "greater_than",
            "value": 75
        }))
        .unwrap();

        assert_eq!(condition.operator, Operator::GreaterThan);
        assert_eq!(condition.kind, ConditionKind::Field);
        assert_eq!(condition.value, json!(75));
    }

    #[test]
    fn test_group_logic_accepts_both_cases() {
        let upper: ConditionGroup =
            serde_json::from_value(json!({"logic": "OR", "conditions": []})).unwrap();
        let lower: ConditionGroup =
            serde_json::from_value(json!({"logic": "or", "conditions": []})).unwrap();
        assert_eq!(upper.logic, Logic::Or);
        assert_eq!(lower.logic, Logic::Or);
        assert_eq!(serde_json::to_value(upper).unwrap()["logic"], "OR");
    }

    #[test]
    fn test_operator_from_str() {
        assert_eq!("not_in".parse::<Operator>().unwrap(), Operator::NotIn);
        assert!("between".parse::<Operator>().is_err());
    }

    #[test]
    fn test_group_depth() {
        let group = ConditionGroup::and(vec![]).with_group(
            ConditionGroup::or(vec![]).with_group(ConditionGroup::and(vec![])),
        );
        assert_eq!(group.depth(), 3);
        assert_eq!(ConditionGroup::default().depth(), 1);
    }
}
