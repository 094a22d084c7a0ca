//! Condition evaluator.
//!
//! Field conditions are decided with the declared type's comparison rules;
//! script/api/ai conditions are delegated to [`ExternalChecks`]. Failures are
//! surfaced as typed errors and never collapse into `false`.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use super::external::ExternalChecks;
use super::types::{Condition, ConditionGroup, ConditionKind, ConditionRef, Context, Logic, Operator};
use crate::error::{Error, Result};
use crate::fields::{FieldDefinition, FieldRegistry, FieldType};
use crate::metrics;

/// Deepest group nesting accepted. The editor caps visual nesting at 3.
pub const MAX_GROUP_DEPTH: usize = 16;

type GroupFuture<'a> = Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;

/// Evaluates conditions and groups against a context.
#[derive(Clone)]
pub struct ConditionEvaluator {
    fields: Arc<FieldRegistry>,
    external: Option<Arc<dyn ExternalChecks>>,
}

impl ConditionEvaluator {
    pub fn new(fields: Arc<FieldRegistry>) -> Self {
        Self {
            fields,
            external: None,
        }
    }

    /// Attach the provider used for script/api/ai conditions.
    pub fn with_external(mut self, external: Arc<dyn ExternalChecks>) -> Self {
        self.external = Some(external);
        self
    }

    pub fn fields(&self) -> &FieldRegistry {
        &self.fields
    }

    /// Evaluate a condition or a group.
    pub async fn evaluate<'a>(
        &self,
        target: impl Into<ConditionRef<'a>>,
        ctx: &Context,
    ) -> Result<bool> {
        match target.into() {
            ConditionRef::Condition(condition) => self.evaluate_condition(condition, ctx).await,
            ConditionRef::Group(group) => self.evaluate_group(group, ctx).await,
        }
    }

    /// Evaluate a single leaf condition.
    pub async fn evaluate_condition(&self, condition: &Condition, ctx: &Context) -> Result<bool> {
        match condition.kind {
            ConditionKind::Field => self.evaluate_field(condition, ctx),
            ConditionKind::Script | ConditionKind::Api | ConditionKind::Ai => {
                self.evaluate_external(condition, ctx).await
            }
        }
    }

    /// Evaluate a group with AND/OR short-circuiting.
    pub async fn evaluate_group(&self, group: &ConditionGroup, ctx: &Context) -> Result<bool> {
        self.evaluate_group_at(group, ctx, 1).await
    }

    fn evaluate_group_at<'a>(
        &'a self,
        group: &'a ConditionGroup,
        ctx: &'a Context,
        depth: usize,
    ) -> GroupFuture<'a> {
        Box::pin(async move {
            if depth > MAX_GROUP_DEPTH {
                return Err(Error::ConditionEvaluation(format!(
                    "Condition group nesting exceeds the maximum depth of {}",
                    MAX_GROUP_DEPTH
                )));
            }

            // Identity elements: an empty AND holds, an empty OR does not.
            let short_circuit_on = match group.logic {
                Logic::And => false,
                Logic::Or => true,
            };

            for condition in &group.conditions {
                if self.evaluate_condition(condition, ctx).await? == short_circuit_on {
                    return Ok(short_circuit_on);
                }
            }

            for child in &group.groups {
                if self.evaluate_group_at(child, ctx, depth + 1).await? == short_circuit_on {
                    return Ok(short_circuit_on);
                }
            }

            Ok(!short_circuit_on)
        })
    }

    /// Evaluate a field condition. Synchronous: no external calls involved.
    pub fn evaluate_field(&self, condition: &Condition, ctx: &Context) -> Result<bool> {
        let def = self.fields.lookup(&condition.field)?;
        let op = condition.operator;

        if !supported_operators(def.field_type).contains(&op) {
            return Err(Error::UnsupportedOperator {
                field: def.name.clone(),
                operator: op.to_string(),
                field_type: def.field_type.to_string(),
            });
        }

        if !op.ignores_value() {
            check_value(def, op, &condition.value)?;
        }

        let actual = match lookup_value(ctx, &condition.field) {
            Some(value) if !value.is_null() => value,
            _ => {
                return Ok(match op {
                    Operator::Empty => true,
                    Operator::NotEmpty => false,
                    _ => {
                        warn!(
                            field = %condition.field,
                            operator = %op,
                            "Field missing from context, condition evaluates to false"
                        );
                        false
                    }
                });
            }
        };

        let result = match op {
            Operator::Empty => is_empty_value(def.field_type, actual),
            Operator::NotEmpty => !is_empty_value(def.field_type, actual),
            _ => compare(def, op, actual, &condition.value)?,
        };

        debug!(field = %condition.field, operator = %op, result, "Evaluated field condition");
        Ok(result)
    }

    async fn evaluate_external(&self, condition: &Condition, ctx: &Context) -> Result<bool> {
        let kind = condition.kind;
        let Some(external) = self.external.as_ref() else {
            metrics::record_condition_error(&kind.to_string());
            return Err(Error::ConditionEvaluation(format!(
                "No provider configured for {} condition '{}'",
                kind, condition.id
            )));
        };

        let outcome = match kind {
            ConditionKind::Script => external.run_script(condition, ctx).await,
            ConditionKind::Api => external.call_api(condition, ctx).await,
            ConditionKind::Ai => external.classify(condition, ctx).await,
            ConditionKind::Field => unreachable!("field conditions are evaluated locally"),
        };

        outcome.map_err(|e| {
            metrics::record_condition_error(&kind.to_string());
            match e {
                Error::ConditionEvaluation(_) => e,
                other => Error::ConditionEvaluation(format!(
                    "{} condition '{}' failed: {}",
                    kind, condition.id, other
                )),
            }
        })
    }
}

fn supported_operators(field_type: FieldType) -> &'static [Operator] {
    use Operator::*;
    match field_type {
        FieldType::Text => &[Equals, NotEquals, Contains, NotContains, In, NotIn, Empty, NotEmpty],
        FieldType::Number => &[
            Equals,
            NotEquals,
            GreaterThan,
            LessThan,
            GreaterEqual,
            LessEqual,
            In,
            NotIn,
            Empty,
            NotEmpty,
        ],
        FieldType::Date => &[
            Equals,
            NotEquals,
            GreaterThan,
            LessThan,
            GreaterEqual,
            LessEqual,
            Empty,
            NotEmpty,
        ],
        FieldType::Boolean => &[Equals, NotEquals, Empty, NotEmpty],
        FieldType::Select => &[Equals, NotEquals, In, NotIn, Empty, NotEmpty],
        FieldType::Multiselect => &[
            Equals,
            NotEquals,
            Contains,
            NotContains,
            In,
            NotIn,
            Empty,
            NotEmpty,
        ],
    }
}

/// Find a context value by exact key, then by dotted path.
pub(crate) fn lookup_value<'a>(ctx: &'a Context, name: &str) -> Option<&'a Value> {
    if let Some(value) = ctx.get(name) {
        return Some(value);
    }

    let mut segments = name.split('.');
    let mut current = ctx.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn mismatch(def: &FieldDefinition, expected: &str, found: &Value) -> Error {
    Error::TypeMismatch {
        field: def.name.clone(),
        expected: expected.to_string(),
        found: json_type(found).to_string(),
    }
}

pub(super) fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

pub(super) fn as_date(value: &Value) -> Option<DateTime<Utc>> {
    let s = value.as_str()?.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

/// Check that a single (non-list) comparison value fits the field type.
fn check_scalar(def: &FieldDefinition, value: &Value) -> Result<()> {
    let ok = match def.field_type {
        FieldType::Text => value.is_string(),
        FieldType::Number => as_number(value).is_some(),
        FieldType::Date => as_date(value).is_some(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Select | FieldType::Multiselect => is_scalar(value),
    };
    if !ok {
        return Err(mismatch(def, &def.field_type.to_string(), value));
    }

    if def.field_type == FieldType::Select && !def.allows_option(value) {
        return Err(Error::TypeMismatch {
            field: def.name.clone(),
            expected: "a declared option".to_string(),
            found: value.to_string(),
        });
    }
    Ok(())
}

fn check_value(def: &FieldDefinition, op: Operator, value: &Value) -> Result<()> {
    match (def.field_type, op) {
        (_, Operator::In | Operator::NotIn)
        | (FieldType::Multiselect, Operator::Equals | Operator::NotEquals) => {
            let items = value
                .as_array()
                .ok_or_else(|| mismatch(def, "array", value))?;
            for item in items {
                check_scalar(def, item)?;
            }
            Ok(())
        }
        _ => check_scalar(def, value),
    }
}

fn is_empty_value(field_type: FieldType, value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => field_type != FieldType::Text && map.is_empty(),
        _ => false,
    }
}

fn list(value: &Value) -> &[Value] {
    value.as_array().map(Vec::as_slice).unwrap_or(&[])
}

fn compare(def: &FieldDefinition, op: Operator, actual: &Value, expected: &Value) -> Result<bool> {
    match def.field_type {
        FieldType::Text => {
            let a = actual.as_str().ok_or_else(|| mismatch(def, "string", actual))?;
            Ok(match op {
                Operator::Equals => Some(a) == expected.as_str(),
                Operator::NotEquals => Some(a) != expected.as_str(),
                Operator::Contains => expected.as_str().map(|e| a.contains(e)).unwrap_or(false),
                Operator::NotContains => !expected.as_str().map(|e| a.contains(e)).unwrap_or(false),
                Operator::In => list(expected).iter().any(|v| v.as_str() == Some(a)),
                Operator::NotIn => !list(expected).iter().any(|v| v.as_str() == Some(a)),
                _ => false,
            })
        }
        FieldType::Number => {
            let a = as_number(actual).ok_or_else(|| mismatch(def, "number", actual))?;
            if matches!(op, Operator::In | Operator::NotIn) {
                let found = list(expected).iter().any(|v| as_number(v) == Some(a));
                return Ok(if op == Operator::In { found } else { !found });
            }
            let e = as_number(expected).ok_or_else(|| mismatch(def, "number", expected))?;
            Ok(order(op, a.partial_cmp(&e)))
        }
        FieldType::Date => {
            let a = as_date(actual).ok_or_else(|| mismatch(def, "date", actual))?;
            let e = as_date(expected).ok_or_else(|| mismatch(def, "date", expected))?;
            Ok(order(op, Some(a.cmp(&e))))
        }
        FieldType::Boolean => {
            let a = actual.as_bool().ok_or_else(|| mismatch(def, "boolean", actual))?;
            let e = expected.as_bool().ok_or_else(|| mismatch(def, "boolean", expected))?;
            Ok(match op {
                Operator::Equals => a == e,
                Operator::NotEquals => a != e,
                _ => false,
            })
        }
        FieldType::Select => {
            if !is_scalar(actual) {
                return Err(mismatch(def, "select value", actual));
            }
            Ok(match op {
                Operator::Equals => actual == expected,
                Operator::NotEquals => actual != expected,
                Operator::In => list(expected).contains(actual),
                Operator::NotIn => !list(expected).contains(actual),
                _ => false,
            })
        }
        FieldType::Multiselect => {
            let a = actual
                .as_array()
                .ok_or_else(|| mismatch(def, "array", actual))?;
            Ok(match op {
                Operator::Contains => a.contains(expected),
                Operator::NotContains => !a.contains(expected),
                Operator::In => a.iter().any(|v| list(expected).contains(v)),
                Operator::NotIn => !a.iter().any(|v| list(expected).contains(v)),
                Operator::Equals => as_set(a) == as_set(list(expected)),
                Operator::NotEquals => as_set(a) != as_set(list(expected)),
                _ => false,
            })
        }
    }
}

fn order(op: Operator, ordering: Option<std::cmp::Ordering>) -> bool {
    use std::cmp::Ordering::*;
    let Some(ordering) = ordering else {
        return false;
    };
    match op {
        Operator::Equals => ordering == Equal,
        Operator::NotEquals => ordering != Equal,
        Operator::GreaterThan => ordering == Greater,
        Operator::LessThan => ordering == Less,
        Operator::GreaterEqual => ordering != Less,
        Operator::LessEqual => ordering != Greater,
        _ => false,
    }
}

fn as_set(items: &[Value]) -> HashSet<String> {
    items.iter().map(Value::to_string).collect()
}
