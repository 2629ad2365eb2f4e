use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use shared::protocol::{ChatMessage, PushNotification};

use crate::{rest::check_status, PushRelay};

const PREVIEW_CHARS: usize = 120;

/// Builds the notification sent to a recipient's device for a new chat message.
pub fn chat_notification(device_token: &str, sender_name: &str, message: &ChatMessage) -> PushNotification {
    let mut body: String = message.content.chars().take(PREVIEW_CHARS).collect();
    if message.content.chars().count() > PREVIEW_CHARS {
        body.push('…');
    }
    PushNotification {
        to: device_token.to_string(),
        title: sender_name.to_string(),
        body,
        data: json!({
            "type": "chat_message",
            "message_id": message.id,
            "sender_id": message.sender_id,
        }),
    }
}

/// Posts notifications to an HTTP push relay.
pub struct HttpPushRelay {
    http: Client,
    url: String,
}

impl HttpPushRelay {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl PushRelay for HttpPushRelay {
    async fn send(&self, notification: &PushNotification) -> Result<()> {
        let response = self
            .http
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .context("push relay request failed")?;
        let ack: Value = check_status(response)
            .await?
            .json()
            .await
            .unwrap_or(Value::Null);

        // The relay acknowledges per ticket; an error ticket means the token was refused.
        if ack.pointer("/data/status").and_then(Value::as_str) == Some("error") {
            let message = ack
                .pointer("/data/message")
                .and_then(Value::as_str)
                .unwrap_or("push relay rejected the notification");
            return Err(anyhow!(message.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/push_tests.rs"]
mod tests;
