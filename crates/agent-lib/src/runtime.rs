//! Container runtime capabilities consumed by the agent
//!
//! The agent never talks to a runtime directly; it goes through these
//! traits so the daemon can plug in the Docker Engine and tests can plug
//! in mocks.

use crate::models::{BackupRecord, InspectInfo, StatsSnapshot};
use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Output stream of a container (raw or multiplexed, see `console::frame`)
pub type LogStream = Box<dyn AsyncRead + Send + Unpin>;

/// Writable stdin of a container's main process
pub type AttachedInput = Box<dyn AsyncWrite + Send + Unpin>;

/// Point-in-time resource statistics
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn stats_snapshot(&self, handle: &str) -> Result<StatsSnapshot>;
}

/// Container lifecycle primitives
#[async_trait]
pub trait LifecycleControl: Send + Sync {
    async fn start(&self, handle: &str) -> Result<()>;

    async fn stop(&self, handle: &str) -> Result<()>;

    async fn restart(&self, handle: &str) -> Result<()>;

    async fn inspect(&self, handle: &str) -> Result<InspectInfo>;
}

/// Creates backups of a server's data
#[async_trait]
pub trait BackupService: Send + Sync {
    async fn create_backup(&self, target_id: &str) -> Result<BackupRecord>;
}

/// Streams used by the console bridge
#[async_trait]
pub trait ConsoleAttach: Send + Sync {
    /// Follow the container's output, starting `tail` lines back ("all" for everything)
    async fn open_log_stream(&self, handle: &str, tail: &str) -> Result<LogStream>;

    async fn open_attached_input(&self, handle: &str) -> Result<AttachedInput>;
}
