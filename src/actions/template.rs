//! `{{ field }}` placeholder rendering over the run context.

use std::sync::OnceLock;

use regex_lite::Regex;
use serde_json::Value;

use crate::conditions::evaluator::lookup_value;
use crate::conditions::Context;

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER_REGEX: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER_REGEX
        .get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("valid regex"))
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Replace `{{ path }}` with the context value at `path` (dotted paths allowed).
///
/// Unknown paths render as the empty string.
pub fn render_template(template: &str, ctx: &Context) -> String {
    placeholder_regex()
        .replace_all(template, |caps: &regex_lite::Captures| {
            lookup_value(ctx, &caps[1])
                .map(value_to_string)
                .unwrap_or_default()
        })
        .to_string()
}

/// Render every string inside a JSON value.
///
/// A string that is exactly one placeholder keeps the referenced value's
/// JSON type.
pub fn render_value(value: &Value, ctx: &Context) -> Value {
    match value {
        Value::String(s) => {
            if let Some(caps) = placeholder_regex().captures(s.trim()) {
                if caps[0].len() == s.trim().len() {
                    return lookup_value(ctx, &caps[1]).cloned().unwrap_or(Value::Null);
                }
            }
            Value::String(render_template(s, ctx))
        }
        Value::Object(obj) => Value::Object(
            obj.iter()
                .map(|(k, v)| (k.clone(), render_value(v, ctx)))
                .collect(),
        ),
        Value::Array(arr) => Value::Array(arr.iter().map(|v| render_value(v, ctx)).collect()),
        _ => value.clone(),
    }
}
