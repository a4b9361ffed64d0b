//! Out-of-band notification for receivers who are not connected.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::models::Message;

#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn notify_offline(&self, receiver_id: Uuid, message: &Message) -> anyhow::Result<()>;
}

/// Logs instead of notifying. Used when no gateway is configured.
#[derive(Debug, Default, Clone)]
pub struct LogPushNotifier;

#[async_trait]
impl PushNotifier for LogPushNotifier {
    async fn notify_offline(&self, receiver_id: Uuid, message: &Message) -> anyhow::Result<()> {
        info!(
            receiver_id = %receiver_id,
            message_id = %message.id,
            "receiver offline, push gateway not configured"
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    user_id: Uuid,
    sender_id: Uuid,
    message_id: Uuid,
    conversation_id: Option<Uuid>,
    preview: &'a str,
}

/// POSTs a notification request to the push gateway
#[derive(Clone)]
pub struct HttpPushNotifier {
    client: Client,
    gateway_url: String,
}

impl HttpPushNotifier {
    pub fn new(gateway_url: String) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("building push gateway client")?;
        Ok(Self {
            client,
            gateway_url: gateway_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PushNotifier for HttpPushNotifier {
    async fn notify_offline(&self, receiver_id: Uuid, message: &Message) -> anyhow::Result<()> {
        let preview = message.preview();
        let body = PushRequest {
            user_id: receiver_id,
            sender_id: message.sender_id,
            message_id: message.id,
            conversation_id: message.conversation_id,
            preview: &preview,
        };

        let response = self
            .client
            .post(format!("{}/v1/notifications", self.gateway_url))
            .json(&body)
            .send()
            .await
            .context("push gateway request failed")?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(anyhow!("push gateway returned {status}: {text}"))
        }
    }
}
