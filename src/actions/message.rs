//! send_message - render a template and deliver it to a contact.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::template::render_template;
use super::{parse_config, ActionContext, ActionHandler, ActionOutput};
use crate::error::{Error, Result};

pub struct SendMessageAction {
    client: Client,
    endpoint: Option<String>,
}

impl SendMessageAction {
    pub fn new(endpoint: Option<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build HTTP client with timeout defaults: {}", e);
                Client::new()
            });
        Self { client, endpoint }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageConfig {
    template: String,
    #[serde(default = "default_channel")]
    channel: String,
    /// Recipient; defaults to the context's `phone` or `email` by channel.
    #[serde(default)]
    to: Option<String>,
}

fn default_channel() -> String {
    "whatsapp".to_string()
}

fn default_recipient(channel: &str, ctx: &ActionContext) -> Option<String> {
    let key = if channel == "email" { "email" } else { "phone" };
    ctx.context.get(key).and_then(Value::as_str).map(str::to_string)
}

#[async_trait]
impl ActionHandler for SendMessageAction {
    fn action_type(&self) -> &str {
        "send_message"
    }

    fn description(&self) -> &str {
        "Send a templated message to the contact"
    }

    async fn execute(&self, config: &Value, ctx: &ActionContext) -> Result<ActionOutput> {
        let config: MessageConfig = parse_config(self.action_type(), config)?;
        let text = render_template(&config.template, &ctx.context);
        let to = match &config.to {
            Some(to) => Some(render_template(to, &ctx.context)),
            None => default_recipient(&config.channel, ctx),
        };

        let delivered = match &self.endpoint {
            Some(endpoint) => {
                let response = self
                    .client
                    .post(endpoint)
                    .json(&json!({
                        "channel": config.channel,
                        "to": to,
                        "text": text,
                        "runId": ctx.run_id,
                    }))
                    .send()
                    .await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(Error::action(
                        &ctx.node_id,
                        format!("Messaging endpoint returned {}", status.as_u16()),
                    ));
                }
                info!(channel = %config.channel, "Message delivered");
                true
            }
            None => {
                debug!(channel = %config.channel, "No messaging endpoint, message recorded only");
                false
            }
        };

        let mut updates = Map::new();
        updates.insert("lastMessageChannel".to_string(), json!(config.channel));

        Ok(ActionOutput::new(json!({
            "channel": config.channel,
            "to": to,
            "text": text,
            "delivered": delivered,
        }))
        .with_context_updates(updates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_renders_without_endpoint() {
        let action = SendMessageAction::new(None, Duration::from_secs(1));
        let context = json!({"name": "Omar", "phone": "+966500000000"})
            .as_object()
            .cloned()
            .unwrap();
        let ctx = ActionContext::new("run", "flow", "msg", context);

        let output = action
            .execute(&json!({"template": "Welcome {{ name }}!"}), &ctx)
            .await
            .unwrap();
        assert_eq!(output.data["text"], "Welcome Omar!");
        assert_eq!(output.data["to"], "+966500000000");
        assert_eq!(output.data["delivered"], false);
        assert_eq!(output.context_updates().unwrap()["lastMessageChannel"], "whatsapp");
    }

    #[tokio::test]
    async fn test_missing_template_is_config_error() {
        let action = SendMessageAction::new(None, Duration::from_secs(1));
        let ctx = ActionContext::new("run", "flow", "msg", Map::new());
        let err = action.execute(&json!({}), &ctx).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
