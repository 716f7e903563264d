//! API client for the host agent

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

/// API client for the host agent
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// Make a GET request; any non-2xx status is an error
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let (_, value) = self.get_with_status(path, |s| s.is_success()).await?;
        Ok(value)
    }

    /// Make a GET request, parsing the body for every status `accept` allows.
    /// Health endpoints answer 503 with a body worth showing.
    pub async fn get_with_status<T: DeserializeOwned>(
        &self,
        path: &str,
        accept: impl Fn(StatusCode) -> bool,
    ) -> Result<(StatusCode, T)> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        let status = response.status();
        if !accept(status) {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, error_message(&body));
        }

        let value = response.json().await.context("Failed to parse response")?;
        Ok((status, value))
    }
}

/// The agent answers errors as `{"error": "..."}`
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}
