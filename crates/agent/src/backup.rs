//! Backup service clients

use agent_lib::models::BackupRecord;
use agent_lib::runtime::BackupService;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use url::Url;

/// Backups can take a while for large worlds
const BACKUP_TIMEOUT: Duration = Duration::from_secs(600);

/// Requests backups from the panel's HTTP API
pub struct HttpBackupService {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpBackupService {
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(BACKUP_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(endpoint).context("Invalid backup endpoint")?;

        Ok(Self {
            client,
            base_url,
            token: token.filter(|t| !t.is_empty()),
        })
    }

    fn backups_url(&self, target_id: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Backup endpoint cannot be a base URL"))?
            .pop_if_empty()
            .extend(["api", "v1", "servers", target_id, "backups"]);
        Ok(url)
    }
}

#[async_trait]
impl BackupService for HttpBackupService {
    async fn create_backup(&self, target_id: &str) -> Result<BackupRecord> {
        let url = self.backups_url(target_id)?;

        let mut request = self.client.post(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .context("Failed to send backup request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Backup API error ({}): {}", status, body.trim());
        }

        response
            .json()
            .await
            .context("Failed to parse backup response")
    }
}

/// Used when no backup endpoint is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredBackups;

#[async_trait]
impl BackupService for UnconfiguredBackups {
    async fn create_backup(&self, target_id: &str) -> Result<BackupRecord> {
        anyhow::bail!(
            "cannot back up server {}: no backup endpoint configured (set GAMEHOST_BACKUP_ENDPOINT)",
            target_id
        )
    }
}
