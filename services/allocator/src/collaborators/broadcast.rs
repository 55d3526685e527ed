//! Event broadcasters.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rackalloc_events::EventEnvelope;
use tracing::{debug, error, info};

use super::Broadcaster;

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogBroadcaster;

#[async_trait]
impl Broadcaster for LogBroadcaster {
    async fn publish(&self, envelope: &EventEnvelope<serde_json::Value>) -> Result<()> {
        info!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            allocation = %envelope.allocation,
            actor = %envelope.actor_type,
            payload = %envelope.payload,
            "allocation event"
        );
        Ok(())
    }
}

/// POSTs every event envelope as JSON to a webhook.
pub struct WebhookBroadcaster {
    client: reqwest::Client,
    url: String,
}

impl WebhookBroadcaster {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Broadcaster for WebhookBroadcaster {
    async fn publish(&self, envelope: &EventEnvelope<serde_json::Value>) -> Result<()> {
        debug!(url = %self.url, event_type = %envelope.event_type, "posting event");

        let response = self.client.post(&self.url).json(envelope).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Webhook rejected event");
            anyhow::bail!("Webhook rejected event: {} - {}", status, body);
        }

        Ok(())
    }
}
