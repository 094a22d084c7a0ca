//! Connection guard expressions.
//!
//! A guard is either a branch label (`true` / `false`) matched against the
//! source node's own condition result, or a small comparison language:
//!
//! ```text
//! score > 50 && temperature == "hot" || tags contains "vip"
//! ```
//!
//! `&&` binds tighter than `||`. Expressions are compiled into a
//! [`ConditionGroup`] so the evaluator's field typing applies to them.

use std::sync::OnceLock;

use regex_lite::Regex;
use serde_json::Value;

use super::evaluator::{as_date, as_number, ConditionEvaluator};
use super::types::{Condition, ConditionGroup, Context, Logic, Operator};
use crate::error::{Error, Result};

/// Parsed guard of a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    /// `true` / `false` label compared with the node's branch result.
    Branch(bool),
    /// Expression evaluated against the run context.
    Expression(ConditionGroup),
}

impl Guard {
    pub fn parse(source: &str) -> Result<Self> {
        let trimmed = source.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "true" | "yes" => return Ok(Guard::Branch(true)),
            "false" | "no" => return Ok(Guard::Branch(false)),
            _ => {}
        }
        if trimmed.is_empty() {
            return Err(Error::Parse("Empty guard expression".to_string()));
        }

        let mut alternatives = Vec::new();
        for alternative in split_top_level(trimmed, "||") {
            let mut terms = Vec::new();
            for term in split_top_level(&alternative, "&&") {
                terms.push(parse_term(&term)?);
            }
            alternatives.push(ConditionGroup::and(terms));
        }

        let group = if alternatives.len() == 1 {
            alternatives.remove(0)
        } else {
            ConditionGroup {
                logic: Logic::Or,
                groups: alternatives,
                ..ConditionGroup::default()
            }
        };
        Ok(Guard::Expression(group))
    }

    /// Whether the guard lets the run through.
    ///
    /// `branch` is the source node's own condition result, if it has one.
    pub async fn matches(
        &self,
        evaluator: &ConditionEvaluator,
        ctx: &Context,
        branch: Option<bool>,
    ) -> Result<bool> {
        match self {
            Guard::Branch(expected) => branch.map(|b| b == *expected).ok_or_else(|| {
                Error::ConditionEvaluation(
                    "Branch label used on a node without conditions".to_string(),
                )
            }),
            Guard::Expression(group) => evaluator.evaluate_group(group, ctx).await,
        }
    }

    /// Whether no run can satisfy both guards.
    ///
    /// Conservative: returns `true` only when every pair of alternatives has
    /// two terms on the same field that contradict each other (disjoint
    /// numeric ranges, distinct equality literals, `==`/`!=` on one value,
    /// or `empty`/`not_empty`). Anything it cannot decide counts as overlap.
    pub fn excludes(&self, other: &Guard) -> bool {
        match (self, other) {
            (Guard::Branch(a), Guard::Branch(b)) => a != b,
            (Guard::Expression(a), Guard::Expression(b)) => {
                let (Some(left), Some(right)) = (alternatives(a), alternatives(b)) else {
                    return false;
                };
                left.iter()
                    .all(|x| right.iter().all(|y| conjunctions_exclude(x, y)))
            }
            _ => false,
        }
    }
}

/// OR-of-AND term lists of a parsed guard expression.
fn alternatives(group: &ConditionGroup) -> Option<Vec<&[Condition]>> {
    fn conjunction(g: &ConditionGroup) -> Option<&[Condition]> {
        (g.logic == Logic::And && g.groups.is_empty()).then_some(g.conditions.as_slice())
    }
    match group.logic {
        Logic::And => Some(vec![conjunction(group)?]),
        Logic::Or if group.conditions.is_empty() => group.groups.iter().map(conjunction).collect(),
        Logic::Or => None,
    }
}

fn conjunctions_exclude(a: &[Condition], b: &[Condition]) -> bool {
    a.iter()
        .any(|x| b.iter().any(|y| x.field == y.field && terms_exclude(x, y)))
}

fn terms_exclude(a: &Condition, b: &Condition) -> bool {
    use Operator::*;
    match (a.operator, b.operator) {
        (Empty, NotEmpty) | (NotEmpty, Empty) => true,
        (Equals, NotEquals) | (NotEquals, Equals) => a.value == b.value,
        (Equals, Equals) if !a.value.is_number() || !b.value.is_number() => {
            is_literal(&a.value) && is_literal(&b.value) && !same_literal(&a.value, &b.value)
        }
        _ => match (Range::of(a), Range::of(b)) {
            (Some(x), Some(y)) => x.disjoint(&y),
            _ => false,
        },
    }
}

fn is_literal(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

/// Equal under any of the evaluator's coercions (numeric strings, dates).
fn same_literal(a: &Value, b: &Value) -> bool {
    a == b
        || matches!((as_number(a), as_number(b)), (Some(x), Some(y)) if x == y)
        || matches!((as_date(a), as_date(b)), (Some(x), Some(y)) if x == y)
}

/// Numeric interval admitted by a single comparison term.
#[derive(Debug, Clone, Copy)]
struct Range {
    low: f64,
    low_open: bool,
    high: f64,
    high_open: bool,
}

impl Range {
    fn of(condition: &Condition) -> Option<Self> {
        let Value::Number(n) = &condition.value else {
            return None;
        };
        let v = n.as_f64()?;
        let (low, low_open, high, high_open) = match condition.operator {
            Operator::GreaterThan => (v, true, f64::INFINITY, false),
            Operator::GreaterEqual => (v, false, f64::INFINITY, false),
            Operator::LessThan => (f64::NEG_INFINITY, false, v, true),
            Operator::LessEqual => (f64::NEG_INFINITY, false, v, false),
            Operator::Equals => (v, false, v, false),
            _ => return None,
        };
        Some(Self {
            low,
            low_open,
            high,
            high_open,
        })
    }

    fn disjoint(&self, other: &Range) -> bool {
        let (low, low_open) = if self.low == other.low {
            (self.low, self.low_open || other.low_open)
        } else if self.low > other.low {
            (self.low, self.low_open)
        } else {
            (other.low, other.low_open)
        };
        let (high, high_open) = if self.high == other.high {
            (self.high, self.high_open || other.high_open)
        } else if self.high < other.high {
            (self.high, self.high_open)
        } else {
            (other.high, other.high_open)
        };
        low > high || (low == high && (low_open || high_open))
    }
}

fn term_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\s*([A-Za-z_][A-Za-z0-9_.]*)\s*(>=|<=|==|!=|>|<|=|\bnot_contains\b|\bcontains\b|\bnot_in\b|\bin\b)\s*(.+?)\s*$",
        )
        .expect("guard term regex is valid")
    })
}

fn parse_term(term: &str) -> Result<Condition> {
    let caps = term_regex()
        .captures(term)
        .ok_or_else(|| Error::Parse(format!("Cannot parse guard term: '{}'", term.trim())))?;

    let field = &caps[1];
    let operator = match &caps[2] {
        "==" | "=" => Operator::Equals,
        "!=" => Operator::NotEquals,
        ">" => Operator::GreaterThan,
        "<" => Operator::LessThan,
        ">=" => Operator::GreaterEqual,
        "<=" => Operator::LessEqual,
        "contains" => Operator::Contains,
        "not_contains" => Operator::NotContains,
        "in" => Operator::In,
        "not_in" => Operator::NotIn,
        other => return Err(Error::Parse(format!("Unknown guard operator: {}", other))),
    };
    let value = parse_literal(&caps[3]);

    // `x == null` / `x != null` read naturally as emptiness checks
    let condition = match (operator, &value) {
        (Operator::Equals, Value::Null) => Condition::field(field, Operator::Empty, Value::Null),
        (Operator::NotEquals, Value::Null) => {
            Condition::field(field, Operator::NotEmpty, Value::Null)
        }
        _ => Condition::field(field, operator, value),
    };
    Ok(condition)
}

fn parse_literal(raw: &str) -> Value {
    let raw = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return value;
    }
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        return Value::String(raw[1..raw.len() - 1].to_string());
    }
    if raw.starts_with('[') && raw.ends_with(']') {
        let items = split_top_level(&raw[1..raw.len() - 1], ",")
            .iter()
            .filter(|s| !s.trim().is_empty())
            .map(|s| parse_literal(s))
            .collect();
        return Value::Array(items);
    }
    Value::String(raw.to_string())
}

/// Split on `sep` outside of quotes and brackets.
fn split_top_level(input: &str, sep: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut rest = input;

    while let Some(c) = rest.chars().next() {
        if quote.is_none() && depth == 0 && rest.starts_with(sep) {
            parts.push(std::mem::take(&mut current));
            rest = &rest[sep.len()..];
            continue;
        }
        match (quote, c) {
            (Some(q), _) if c == q => quote = None,
            (None, '"' | '\'') => quote = Some(c),
            (None, '[' | '(') => depth += 1,
            (None, ']' | ')') => depth -= 1,
            _ => {}
        }
        current.push(c);
        rest = &rest[c.len_utf8()..];
    }
    parts.push(current);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldRegistry;
    use serde_json::json;
    use std::sync::Arc;

    fn evaluator() -> ConditionEvaluator {
        ConditionEvaluator::new(Arc::new(FieldRegistry::builtin()))
    }

    fn ctx(value: Value) -> Context {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_branch_labels() {
        assert_eq!(Guard::parse("true").unwrap(), Guard::Branch(true));
        assert_eq!(Guard::parse(" FALSE ").unwrap(), Guard::Branch(false));
    }

    #[test]
    fn test_parse_single_term() {
        let Guard::Expression(group) = Guard::parse("score > 50").unwrap() else {
            panic!("expected expression");
        };
        assert_eq!(group.logic, Logic::And);
        assert_eq!(group.conditions.len(), 1);
        assert_eq!(group.conditions[0].field, "score");
        assert_eq!(group.conditions[0].operator, Operator::GreaterThan);
        assert_eq!(group.conditions[0].value, json!(50));
    }

    #[test]
    fn test_parse_precedence() {
        let Guard::Expression(group) =
            Guard::parse("score > 50 && temperature == \"hot\" || tags contains 'vip'").unwrap()
        else {
            panic!("expected expression");
        };
        assert_eq!(group.logic, Logic::Or);
        assert_eq!(group.groups.len(), 2);
        assert_eq!(group.groups[0].conditions.len(), 2);
        assert_eq!(group.groups[1].conditions[0].value, json!("vip"));
    }

    #[test]
    fn test_separators_inside_quotes_are_literal() {
        let Guard::Expression(group) = Guard::parse("company == \"A && B\"").unwrap() else {
            panic!("expected expression");
        };
        assert_eq!(group.conditions[0].value, json!("A && B"));
    }

    #[test]
    fn test_in_list_literal() {
        let Guard::Expression(group) = Guard::parse("source in ['ads', 'social']").unwrap() else {
            panic!("expected expression");
        };
        assert_eq!(group.conditions[0].operator, Operator::In);
        assert_eq!(group.conditions[0].value, json!(["ads", "social"]));
    }

    #[test]
    fn test_null_comparison_maps_to_emptiness() {
        let Guard::Expression(group) = Guard::parse("email != null").unwrap() else {
            panic!("expected expression");
        };
        assert_eq!(group.conditions[0].operator, Operator::NotEmpty);
    }

    #[test]
    fn test_invalid_term() {
        assert!(matches!(Guard::parse("score >"), Err(Error::Parse(_))));
        assert!(matches!(Guard::parse(""), Err(Error::Parse(_))));
    }

    #[tokio::test]
    async fn test_mutually_exclusive_guards() {
        let ev = evaluator();
        let data = ctx(json!({"score": 60}));
        let high = Guard::parse("score > 50").unwrap();
        let low = Guard::parse("score <= 50").unwrap();

        assert!(high.matches(&ev, &data, None).await.unwrap());
        assert!(!low.matches(&ev, &data, None).await.unwrap());
    }

    fn excludes(a: &str, b: &str) -> bool {
        let (a, b) = (Guard::parse(a).unwrap(), Guard::parse(b).unwrap());
        let forward = a.excludes(&b);
        assert_eq!(forward, b.excludes(&a));
        forward
    }

    #[test]
    fn test_exclusive_numeric_ranges() {
        assert!(excludes("score > 50", "score <= 50"));
        assert!(excludes("score < 10", "score >= 10"));
        assert!(excludes("score == 5", "score > 5"));
        assert!(!excludes("score > 50", "score > 60"));
        assert!(!excludes("score >= 50", "score <= 50"));
        assert!(!excludes("score > 50", "budget <= 50"));
    }

    #[test]
    fn test_exclusive_literals() {
        assert!(excludes("temperature == 'hot'", "temperature == 'cold'"));
        assert!(excludes("temperature == 'hot'", "temperature != 'hot'"));
        assert!(excludes("email == null", "email != null"));
        assert!(!excludes("temperature == 'hot'", "temperature != 'cold'"));
        assert!(!excludes("score == 50", "score == '50'"));
        assert!(!excludes("source in ['ads']", "source in ['social']"));
    }

    #[test]
    fn test_exclusive_compound_guards() {
        // One contradicting term is enough for a conjunction
        assert!(excludes(
            "score > 50 && temperature == 'hot'",
            "score <= 50 && temperature == 'hot'"
        ));
        // Every alternative must be excluded
        assert!(excludes("score > 80 || score < 20", "score >= 20 && score <= 80"));
        assert!(!excludes("score > 80 || temperature == 'hot'", "score <= 80"));
    }

    #[test]
    fn test_branch_labels_exclusive() {
        assert!(excludes("true", "false"));
        assert!(!excludes("yes", "true"));
        assert!(!excludes("true", "score > 50"));
    }

    #[tokio::test]
    async fn test_branch_guard_requires_branch_result() {
        let ev = evaluator();
        let guard = Guard::parse("true").unwrap();
        assert!(guard.matches(&ev, &ctx(json!({})), Some(true)).await.unwrap());
        assert!(!guard.matches(&ev, &ctx(json!({})), Some(false)).await.unwrap());
        assert!(guard.matches(&ev, &ctx(json!({})), None).await.is_err());
    }
}
