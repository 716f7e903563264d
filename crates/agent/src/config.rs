//! Agent configuration

use agent_lib::collector::CollectionConfig;
use agent_lib::console::{ConsoleConfig, DEFAULT_LOG_TAIL};
use agent_lib::scheduler::{CronZone, SchedulerConfig};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "GAMEHOST_CONFIG";

/// Prefix of environment overrides, e.g. `GAMEHOST_API_PORT`
pub const ENV_PREFIX: &str = "GAMEHOST";

/// Longest accepted `sample_retention_hours` (ten years)
pub const MAX_RETENTION_HOURS: u64 = 24 * 365 * 10;

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Name reported in audit logs
    #[serde(default = "default_host_name")]
    pub host_name: String,

    /// Port for the HTTP API
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Docker Engine Unix socket
    #[serde(default = "default_docker_socket")]
    pub docker_socket: PathBuf,

    /// Telemetry collection interval in seconds
    #[serde(default = "default_collection_interval")]
    pub collection_interval_secs: u64,

    /// Samples older than this are deleted
    #[serde(default = "default_retention_hours")]
    pub sample_retention_hours: u64,

    /// Calendar for cron evaluation (`local` or `utc`)
    #[serde(default)]
    pub cron_timezone: CronZone,

    /// Stamp `last_run` on schedules whose action failed
    #[serde(default = "default_true")]
    pub stamp_failed_runs: bool,

    /// Log lines replayed when a console opens
    #[serde(default = "default_console_log_tail")]
    pub console_log_tail: String,

    /// Base URL of the backup service; scheduled backups fail without it
    #[serde(default)]
    pub backup_endpoint: Option<String>,

    /// Bearer token for the backup service
    #[serde(default)]
    pub backup_token: Option<String>,
}

fn default_host_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./data/gamehost.db")
}

fn default_docker_socket() -> PathBuf {
    PathBuf::from("/var/run/docker.sock")
}

fn default_collection_interval() -> u64 {
    10
}

fn default_retention_hours() -> u64 {
    24
}

fn default_true() -> bool {
    true
}

fn default_console_log_tail() -> String {
    DEFAULT_LOG_TAIL.to_string()
}

impl AgentConfig {
    /// Load from the file named by `GAMEHOST_CONFIG` (if set), then
    /// `GAMEHOST_*` environment variables
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_FILE_ENV).ok().map(PathBuf::from);
        Self::from_sources(file, config::Environment::with_prefix(ENV_PREFIX))
    }

    /// Build from an optional file and an environment source
    pub fn from_sources(file: Option<PathBuf>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = &file {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        let config: AgentConfig = builder
            .add_source(env)
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.collection_interval_secs == 0 {
            anyhow::bail!("collection_interval_secs must be positive");
        }
        if self.sample_retention_hours == 0 {
            anyhow::bail!("sample_retention_hours must be positive");
        }
        if self.sample_retention_hours > MAX_RETENTION_HOURS {
            anyhow::bail!(
                "sample_retention_hours must be at most {}, got {}",
                MAX_RETENTION_HOURS,
                self.sample_retention_hours
            );
        }
        let tail = self.console_log_tail.as_str();
        if tail != "all" && tail.parse::<u32>().is_err() {
            anyhow::bail!("console_log_tail must be a line count or \"all\", got {:?}", tail);
        }
        Ok(())
    }

    pub fn collection_config(&self) -> CollectionConfig {
        let retention = self
            .sample_retention_hours
            .min(MAX_RETENTION_HOURS)
            .try_into()
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or_else(|| chrono::Duration::hours(24));
        CollectionConfig {
            interval: Duration::from_secs(self.collection_interval_secs),
            retention,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            zone: self.cron_timezone,
            stamp_failed_runs: self.stamp_failed_runs,
        }
    }

    pub fn console_config(&self) -> ConsoleConfig {
        ConsoleConfig {
            log_tail: self.console_log_tail.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::with_prefix(ENV_PREFIX).source(Some(map))
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::from_sources(None, env(&[])).unwrap();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.database_path, PathBuf::from("./data/gamehost.db"));
        assert_eq!(config.docker_socket, PathBuf::from("/var/run/docker.sock"));
        assert_eq!(config.collection_interval_secs, 10);
        assert_eq!(config.sample_retention_hours, 24);
        assert_eq!(config.cron_timezone, CronZone::Local);
        assert!(config.stamp_failed_runs);
        assert_eq!(config.console_log_tail, "100");
        assert!(config.backup_endpoint.is_none());
    }

    #[test]
    fn test_environment_overrides() {
        let config = AgentConfig::from_sources(
            None,
            env(&[
                ("GAMEHOST_API_PORT", "9191"),
                ("GAMEHOST_CRON_TIMEZONE", "utc"),
                ("GAMEHOST_STAMP_FAILED_RUNS", "false"),
                ("GAMEHOST_BACKUP_ENDPOINT", "http://panel:3000"),
            ]),
        )
        .unwrap();

        assert_eq!(config.api_port, 9191);
        assert_eq!(config.cron_timezone, CronZone::Utc);
        assert!(!config.scheduler_config().stamp_failed_runs);
        assert_eq!(config.backup_endpoint.as_deref(), Some("http://panel:3000"));
    }

    #[test]
    fn test_file_then_environment() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(
            &path,
            "collection_interval_secs = 5\nsample_retention_hours = 48\napi_port = 7000\n",
        )
        .unwrap();

        let config =
            AgentConfig::from_sources(Some(path), env(&[("GAMEHOST_API_PORT", "7001")])).unwrap();

        assert_eq!(config.api_port, 7001);
        let collection = config.collection_config();
        assert_eq!(collection.interval, Duration::from_secs(5));
        assert_eq!(collection.retention, chrono::Duration::hours(48));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(AgentConfig::from_sources(
            None,
            env(&[("GAMEHOST_COLLECTION_INTERVAL_SECS", "0")])
        )
        .is_err());
        assert!(
            AgentConfig::from_sources(None, env(&[("GAMEHOST_CONSOLE_LOG_TAIL", "lots")])).is_err()
        );
        assert!(
            AgentConfig::from_sources(None, env(&[("GAMEHOST_CRON_TIMEZONE", "mars")])).is_err()
        );
    }

    #[test]
    fn test_oversized_retention_rejected() {
        let err = AgentConfig::from_sources(
            None,
            env(&[("GAMEHOST_SAMPLE_RETENTION_HOURS", "99999999999999")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("sample_retention_hours must be at most"));

        let config = AgentConfig::from_sources(
            None,
            env(&[("GAMEHOST_SAMPLE_RETENTION_HOURS", "87600")]),
        )
        .unwrap();
        assert_eq!(
            config.collection_config().retention,
            chrono::Duration::hours(87_600)
        );
    }
}
