//! call_webhook - make an HTTP request with templated parts.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::template::{render_template, render_value};
use super::{parse_config, ActionContext, ActionHandler, ActionOutput};
use crate::error::{Error, Result};

pub struct CallWebhookAction {
    client: Client,
}

impl CallWebhookAction {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build HTTP client with timeout defaults: {}", e);
                Client::new()
            });
        Self { client }
    }
}

#[derive(Debug, Deserialize)]
struct WebhookConfig {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: Option<Value>,
    #[serde(default)]
    body: Option<Value>,
}

fn default_method() -> String {
    "POST".to_string()
}

#[async_trait]
impl ActionHandler for CallWebhookAction {
    fn action_type(&self) -> &str {
        "call_webhook"
    }

    fn description(&self) -> &str {
        "Call an external HTTP endpoint"
    }

    async fn execute(&self, config: &Value, ctx: &ActionContext) -> Result<ActionOutput> {
        let config: WebhookConfig = parse_config(self.action_type(), config)?;
        let url = render_template(&config.url, &ctx.context);

        let mut request = match config.method.to_uppercase().as_str() {
            "GET" => self.client.get(&url),
            "POST" => self.client.post(&url),
            "PUT" => self.client.put(&url),
            "PATCH" => self.client.patch(&url),
            "DELETE" => self.client.delete(&url),
            other => return Err(Error::Config(format!("Unknown HTTP method: {}", other))),
        };

        if let Some(headers) = config.headers.as_ref().and_then(Value::as_object) {
            for (key, value) in headers {
                let header_value = match value {
                    Value::String(s) => render_template(s, &ctx.context),
                    _ => value.to_string(),
                };
                request = request.header(key, header_value);
            }
        }

        if let Some(body) = &config.body {
            request = request.json(&render_value(body, &ctx.context));
        }

        debug!("Webhook {} {}", config.method, url);
        let start = std::time::Instant::now();
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body_text = response.text().await?;

        if !(200..300).contains(&status) {
            return Err(Error::action(
                &ctx.node_id,
                format!("Webhook {} {} -> {}: {}", config.method, url, status, body_text),
            ));
        }

        info!(
            "Webhook {} {} -> {} ({}ms)",
            config.method,
            url,
            status,
            start.elapsed().as_millis()
        );

        let body: Value =
            serde_json::from_str(&body_text).unwrap_or_else(|_| Value::String(body_text));
        Ok(ActionOutput::new(json!({ "status": status, "body": body })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[tokio::test]
    async fn test_unknown_method() {
        let action = CallWebhookAction::new(Duration::from_secs(1));
        let ctx = ActionContext::new("run", "flow", "hook", Map::new());
        let err = action
            .execute(&json!({"url": "http://example.invalid", "method": "BREW"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_url_required() {
        let action = CallWebhookAction::new(Duration::from_secs(1));
        let ctx = ActionContext::new("run", "flow", "hook", Map::new());
        assert!(action.execute(&json!({}), &ctx).await.is_err());
    }
}
