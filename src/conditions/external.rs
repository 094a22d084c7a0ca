//! Script, API and AI checks used by non-field conditions.

use std::time::Duration;

use async_trait::async_trait;
use rhai::{Dynamic, Engine, Scope};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::types::{Condition, Context};
use crate::error::{Error, Result};

/// Maximum operations a condition script may perform.
const MAX_SCRIPT_OPERATIONS: u64 = 50_000;
/// Maximum string size inside a condition script (100KB).
const MAX_SCRIPT_STRING_SIZE: usize = 100 * 1024;
const MAX_SCRIPT_ARRAY_SIZE: usize = 10_000;
const MAX_SCRIPT_MAP_SIZE: usize = 1_000;
const MAX_SCRIPT_EXPR_DEPTH: usize = 64;
const MAX_SCRIPT_CALL_LEVELS: usize = 16;

const DEFAULT_RESPONSE_FIELD: &str = "result";
const DEFAULT_AI_THRESHOLD: f64 = 0.5;

/// Provider of checks that leave the evaluator: scripts, remote APIs and
/// classification models.
#[async_trait]
pub trait ExternalChecks: Send + Sync {
    async fn run_script(&self, condition: &Condition, ctx: &Context) -> Result<bool>;

    async fn call_api(&self, condition: &Condition, ctx: &Context) -> Result<bool>;

    async fn classify(&self, condition: &Condition, ctx: &Context) -> Result<bool>;
}

#[derive(Debug, Deserialize)]
struct ScriptConfig {
    script: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiConfig {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default = "default_response_field")]
    response_field: String,
}

#[derive(Debug, Deserialize)]
struct AiConfig {
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default = "default_threshold")]
    threshold: f64,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_response_field() -> String {
    DEFAULT_RESPONSE_FIELD.to_string()
}

fn default_threshold() -> f64 {
    DEFAULT_AI_THRESHOLD
}

fn parse_config<T: serde::de::DeserializeOwned>(condition: &Condition, what: &str) -> Result<T> {
    serde_json::from_value(condition.config.clone()).map_err(|e| {
        Error::ConditionEvaluation(format!(
            "Invalid {} config on condition '{}': {}",
            what, condition.id, e
        ))
    })
}

/// Production checks backed by rhai and reqwest.
pub struct DefaultExternalChecks {
    client: reqwest::Client,
    api_timeout: Duration,
    ai_endpoint: Option<String>,
}

impl DefaultExternalChecks {
    pub fn new(api_timeout: Duration, ai_endpoint: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_timeout,
            ai_endpoint,
        }
    }

    async fn post_json(&self, method: &str, url: &str, body: &Value) -> Result<Value> {
        let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|_| Error::ConditionEvaluation(format!("Invalid HTTP method: {}", method)))?;

        let mut request = self
            .client
            .request(method.clone(), url)
            .timeout(self.api_timeout);
        if method != reqwest::Method::GET {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::ConditionEvaluation(format!(
                "{} responded with status {}",
                url,
                status.as_u16()
            )));
        }
        Ok(response.json::<Value>().await?)
    }
}

#[async_trait]
impl ExternalChecks for DefaultExternalChecks {
    async fn run_script(&self, condition: &Condition, ctx: &Context) -> Result<bool> {
        let config: ScriptConfig = parse_config(condition, "script")?;
        evaluate_script(&config.script, ctx)
    }

    async fn call_api(&self, condition: &Condition, ctx: &Context) -> Result<bool> {
        let config: ApiConfig = parse_config(condition, "api")?;
        let body = config
            .body
            .unwrap_or_else(|| Value::Object(ctx.clone()));

        let response = self.post_json(&config.method, &config.url, &body).await?;
        let field = response.get(&config.response_field).ok_or_else(|| {
            Error::ConditionEvaluation(format!(
                "Response from {} has no '{}' field",
                config.url, config.response_field
            ))
        })?;

        debug!(url = %config.url, field = %config.response_field, "API condition answered");
        Ok(is_truthy(field))
    }

    async fn classify(&self, condition: &Condition, ctx: &Context) -> Result<bool> {
        let config: AiConfig = parse_config(condition, "ai")?;
        let endpoint = config
            .endpoint
            .clone()
            .or_else(|| self.ai_endpoint.clone())
            .ok_or_else(|| {
                Error::ConditionEvaluation("No classification endpoint configured".to_string())
            })?;

        let mut request = serde_json::json!({ "labels": config.labels });
        match &config.text {
            Some(text) => request["text"] = Value::String(text.clone()),
            None => request["data"] = Value::Object(ctx.clone()),
        }

        let response = self.post_json("POST", &endpoint, &request).await?;
        let confidence = read_confidence(&response, config.label.as_deref())?;

        debug!(confidence, threshold = config.threshold, "AI condition answered");
        Ok(confidence >= config.threshold)
    }
}

/// Read the model's confidence, per label when one is requested.
fn read_confidence(response: &Value, label: Option<&str>) -> Result<f64> {
    let value = match label {
        Some(label) => response
            .get("scores")
            .and_then(|s| s.get(label))
            .or_else(|| {
                (response.get("label").and_then(Value::as_str) == Some(label))
                    .then(|| response.get("confidence"))
                    .flatten()
            }),
        None => response.get("confidence"),
    };

    value.and_then(Value::as_f64).ok_or_else(|| {
        Error::ConditionEvaluation("Classification response has no confidence".to_string())
    })
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn sandboxed_engine() -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(MAX_SCRIPT_OPERATIONS);
    engine.set_max_string_size(MAX_SCRIPT_STRING_SIZE);
    engine.set_max_array_size(MAX_SCRIPT_ARRAY_SIZE);
    engine.set_max_map_size(MAX_SCRIPT_MAP_SIZE);
    engine.set_max_expr_depths(MAX_SCRIPT_EXPR_DEPTH, MAX_SCRIPT_EXPR_DEPTH);
    engine.set_max_call_levels(MAX_SCRIPT_CALL_LEVELS);
    engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());
    engine.disable_symbol("eval");
    engine
}

/// Run a boolean script with only `data` and `user` in scope.
pub fn evaluate_script(script: &str, ctx: &Context) -> Result<bool> {
    let engine = sandboxed_engine();
    let mut scope = Scope::new();

    let user = ctx.get("user").cloned().unwrap_or(Value::Null);
    scope.push_constant("data", json_to_dynamic(Value::Object(ctx.clone())));
    scope.push_constant("user", json_to_dynamic(user));

    engine
        .eval_with_scope::<bool>(&mut scope, script)
        .map_err(|e| Error::ConditionEvaluation(format!("Script error: {}", e)))
}

fn json_to_dynamic(value: Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::UNIT
            }
        }
        Value::String(s) => Dynamic::from(s),
        Value::Array(items) => {
            let vec: Vec<Dynamic> = items.into_iter().map(json_to_dynamic).collect();
            Dynamic::from(vec)
        }
        Value::Object(obj) => {
            let mut map = rhai::Map::new();
            for (k, v) in obj {
                map.insert(k.into(), json_to_dynamic(v));
            }
            Dynamic::from(map)
        }
    }
}
