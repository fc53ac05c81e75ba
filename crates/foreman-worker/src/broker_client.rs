use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use foreman_core::broker::{StreamBroker, StreamMessage};
use serde_json::json;
use tokio::sync::RwLock;

/// `StreamBroker` over the server's stream relay endpoints.
///
/// The server hosts the authoritative engine; this client gives the worker
/// the same consume/publish/ack contract across the process boundary.
/// Initialization and trimming are server-owned and no-ops here.
pub struct HttpBroker {
    client: reqwest::Client,
    base_url: String,
    token: RwLock<String>,
}

impl HttpBroker {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            token: RwLock::new(String::new()),
        })
    }

    /// Install the bearer token minted at registration.
    pub async fn set_token(&self, token: &str) {
        *self.token.write().await = token.to_string();
    }

    fn url(&self, stream: &str, op: &str) -> String {
        format!("{}/api/v1/streams/{stream}/{op}", self.base_url)
    }
}

#[async_trait]
impl StreamBroker for HttpBroker {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn publish(&self, stream: &str, fields: HashMap<String, String>) -> Result<String> {
        let token = self.token.read().await.clone();
        let response = self
            .client
            .post(self.url(stream, "publish"))
            .bearer_auth(token)
            .json(&json!({ "fields": fields }))
            .send()
            .await
            .context("send publish")?
            .error_for_status()
            .context("publish refused")?;
        let body: serde_json::Value = response.json().await.context("parse publish response")?;
        Ok(body
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }

    async fn consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>> {
        let token = self.token.read().await.clone();
        let response = self
            .client
            .post(self.url(stream, "consume"))
            // The server holds the request open up to block_ms; give the
            // transport some slack on top.
            .timeout(std::time::Duration::from_millis(block_ms + 10_000))
            .bearer_auth(token)
            .json(&json!({
                "group": group,
                "consumer": consumer,
                "count": count,
                "block_ms": block_ms,
            }))
            .send()
            .await
            .context("send consume")?
            .error_for_status()
            .context("consume refused")?;
        response.json().await.context("parse consume response")
    }

    async fn ack(&self, stream: &str, group: &str, message_id: &str) -> Result<()> {
        let token = self.token.read().await.clone();
        self.client
            .post(self.url(stream, "ack"))
            .bearer_auth(token)
            .json(&json!({ "group": group, "message_id": message_id }))
            .send()
            .await
            .context("send ack")?
            .error_for_status()
            .context("ack refused")?;
        Ok(())
    }

    async fn trim(&self, _stream: &str, _maxlen: usize) -> Result<()> {
        Ok(())
    }
}
