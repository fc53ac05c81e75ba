use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker_client::HttpBroker;
use crate::config::WorkerConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Registration {
    pub worker_id: Uuid,
    pub token: String,
    pub heartbeat_interval: u64,
}

/// Registers with the server, keeps presence alive via heartbeats, and
/// re-registers transparently when the server forgets us (TTL expiry).
pub struct WorkerAgent {
    config: WorkerConfig,
    client: reqwest::Client,
    broker: Arc<HttpBroker>,
    registration: RwLock<Option<Registration>>,
    running: AtomicBool,
}

impl WorkerAgent {
    pub fn new(config: WorkerConfig, broker: Arc<HttpBroker>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("build http client")?;
        Ok(Self {
            config,
            client,
            broker,
            registration: RwLock::new(None),
            running: AtomicBool::new(true),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn worker_id(&self) -> Option<Uuid> {
        self.registration.read().await.as_ref().map(|r| r.worker_id)
    }

    /// Install registration state directly (used by register() and tests).
    pub async fn set_registration(&self, registration: Registration) {
        self.broker.set_token(&registration.token).await;
        *self.registration.write().await = Some(registration);
    }

    fn detect_capabilities() -> Vec<String> {
        let mut capabilities = Vec::new();
        if Path::new("/.dockerenv").exists() {
            capabilities.push("docker".to_string());
        }
        capabilities.push("native".to_string());
        capabilities
    }

    /// Register this worker with the server and wire the auth token into
    /// the stream relay client.
    pub async fn register(&self) -> Result<()> {
        let body = json!({
            "name": self.config.worker_name,
            "platform": std::env::consts::OS,
            "capabilities": Self::detect_capabilities(),
            "executor_type": self.config.executor_type,
            "registration_token": self.config.registration_token,
        });

        let response = self
            .client
            .post(format!("{}/api/v1/workers/register", self.config.server_url))
            .json(&body)
            .send()
            .await
            .context("send register request")?
            .error_for_status()
            .context("register refused")?;

        let registration: Registration =
            response.json().await.context("parse register response")?;
        info!("registered as worker {}", registration.worker_id);

        self.set_registration(registration).await;
        Ok(())
    }

    /// Periodically renew presence; on "unknown worker" re-register.
    pub async fn heartbeat_loop(self: Arc<Self>) {
        loop {
            let interval = {
                let reg = self.registration.read().await;
                reg.as_ref()
                    .map(|r| r.heartbeat_interval)
                    .unwrap_or(self.config.heartbeat_interval_s)
            };
            tokio::time::sleep(std::time::Duration::from_secs(interval.max(1))).await;
            if !self.is_running() {
                break;
            }

            let Some(registration) = self.registration.read().await.clone() else {
                continue;
            };

            let result = self
                .client
                .post(format!(
                    "{}/api/v1/workers/{}/heartbeat",
                    self.config.server_url, registration.worker_id
                ))
                .bearer_auth(&registration.token)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                    warn!("server forgot us, re-registering");
                    if let Err(e) = self.register().await {
                        warn!("re-registration failed: {e}");
                    }
                }
                Ok(resp) if !resp.status().is_success() => {
                    warn!("heartbeat rejected: {}", resp.status());
                }
                Ok(_) => {}
                Err(e) => warn!("heartbeat failed: {e}"),
            }
        }
    }

    /// Graceful shutdown: stop loops, deregister best-effort.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        let Some(registration) = self.registration.read().await.clone() else {
            return;
        };
        let result = self
            .client
            .delete(format!(
                "{}/api/v1/workers/{}",
                self.config.server_url, registration.worker_id
            ))
            .send()
            .await;
        if let Err(e) = result {
            warn!("deregister failed: {e}");
        }
    }
}
