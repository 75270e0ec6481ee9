use super::CompletionNotifier;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

/// Posts `{"upload_id": ...}` to an HTTP endpoint fronting the coordinator.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CompletionNotifier for WebhookNotifier {
    async fn notify(&self, upload_id: &str) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&json!({ "upload_id": upload_id }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}
