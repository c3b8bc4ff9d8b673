//! HTTP client for the agent's API

use anyhow::{Context, Result};
use loadpilot_lib::{HealthResponse, StateSnapshot};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

/// Client for a running loadpilot agent
pub struct AgentClient {
    client: Client,
    base_url: Url,
}

impl AgentClient {
    /// Create a new agent client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid agent URL")?;

        Ok(Self { client, base_url })
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(path).await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Agent error ({}): {}", status, body);
        }

        response.json().await.context("Failed to parse response")
    }

    /// Fetch `/healthz`; an unhealthy agent answers 503 with a full body
    pub async fn health(&self) -> Result<HealthResponse> {
        let response = self.send("healthz").await?;

        match response.status() {
            s if s.is_success() || s == StatusCode::SERVICE_UNAVAILABLE => response
                .json()
                .await
                .context("Failed to parse health response"),
            status => {
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("Agent error ({}): {}", status, body)
            }
        }
    }

    /// Fetch the agent's view of the shared state
    pub async fn state(&self) -> Result<StateSnapshot> {
        self.get("state").await
    }

    async fn send(&self, path: &str) -> Result<reqwest::Response> {
        let url = self.base_url.join(path).context("Invalid path")?;
        self.client
            .get(url)
            .send()
            .await
            .context("Failed to reach agent")
    }
}
