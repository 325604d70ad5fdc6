use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use url::Url;

use super::{EventSink, ProgressEvent};

/// POSTs each event as JSON to the build's webhook URL.
///
/// Builds without a webhook URL are skipped silently.
pub struct WebhookSink {
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build webhook HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl EventSink for WebhookSink {
    async fn deliver(&self, target: Option<&Url>, event: &ProgressEvent) -> Result<()> {
        let Some(url) = target else {
            return Ok(());
        };

        self.client
            .post(url.clone())
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
