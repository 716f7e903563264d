//! Docker Engine adapter
//!
//! Talks to the Engine API over its Unix socket with a hyper HTTP/1 client,
//! one connection per call. The log follow stream hands the response body to
//! the console bridge, and attach upgrades the connection to a raw stream.

use agent_lib::models::{CpuCounters, InspectInfo, NetworkCounters, StatsSnapshot, TargetState};
use agent_lib::runtime::{AttachedInput, ConsoleAttach, LifecycleControl, LogStream, MetricsSource};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::header::{CONNECTION, HOST, UPGRADE};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tokio_util::io::StreamReader;
use tracing::debug;

/// Seconds the daemon waits before killing a container on stop/restart
const STOP_TIMEOUT_SECS: u32 = 30;

/// Container runtime backed by the Docker Engine API
#[derive(Debug, Clone)]
pub struct DockerEngine {
    socket_path: PathBuf,
}

impl DockerEngine {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Open a connection, send one request and return the response head.
    /// The body is read through the returned response.
    async fn send(&self, method: Method, path: &str, upgrade: bool) -> Result<Response<Incoming>> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to Docker socket {}",
                    self.socket_path.display()
                )
            })?;

        let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .context("HTTP handshake with Docker failed")?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(error = %e, "Docker connection closed");
            }
        });

        let mut request = Request::builder()
            .method(method.clone())
            .uri(path)
            .header(HOST, "docker");
        if upgrade {
            request = request.header(CONNECTION, "Upgrade").header(UPGRADE, "tcp");
        }
        let request = request
            .body(Full::new(Bytes::new()))
            .context("Failed to build Docker request")?;

        let response = sender
            .send_request(request)
            .await
            .context("Failed to send Docker request")?;
        debug!(method = %method, path = %path, status = %response.status(), "Docker API call");
        Ok(response)
    }

    /// One-shot request returning status and full body
    async fn call(&self, method: Method, path: &str) -> Result<(StatusCode, Bytes)> {
        let response = self.send(method, path, false).await?;
        let status = response.status();
        let body = read_body(response).await?;
        Ok((status, body))
    }

    async fn lifecycle(&self, handle: &str, verb: &str) -> Result<()> {
        validate_handle(handle)?;
        let path = match verb {
            "start" => format!("/containers/{}/start", handle),
            _ => format!("/containers/{}/{}?t={}", handle, verb, STOP_TIMEOUT_SECS),
        };

        let (status, body) = self.call(Method::POST, &path).await?;
        match status {
            // 304: already in the requested state
            StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED => Ok(()),
            _ => Err(api_error(status, &body))
                .with_context(|| format!("Failed to {} container {}", verb, handle)),
        }
    }
}

#[async_trait]
impl MetricsSource for DockerEngine {
    async fn stats_snapshot(&self, handle: &str) -> Result<StatsSnapshot> {
        validate_handle(handle)?;
        let path = format!("/containers/{}/stats?stream=false", handle);
        let (status, body) = self.call(Method::GET, &path).await?;
        if status != StatusCode::OK {
            return Err(api_error(status, &body))
                .with_context(|| format!("Failed to read stats for {}", handle));
        }

        let stats: DockerStats = serde_json::from_slice(&body)
            .with_context(|| format!("Failed to parse stats for {}", handle))?;
        Ok(stats.into_snapshot())
    }
}

#[async_trait]
impl LifecycleControl for DockerEngine {
    async fn start(&self, handle: &str) -> Result<()> {
        self.lifecycle(handle, "start").await
    }

    async fn stop(&self, handle: &str) -> Result<()> {
        self.lifecycle(handle, "stop").await
    }

    async fn restart(&self, handle: &str) -> Result<()> {
        self.lifecycle(handle, "restart").await
    }

    async fn inspect(&self, handle: &str) -> Result<InspectInfo> {
        validate_handle(handle)?;
        let path = format!("/containers/{}/json", handle);
        let (status, body) = self.call(Method::GET, &path).await?;
        if status != StatusCode::OK {
            return Err(api_error(status, &body))
                .with_context(|| format!("Failed to inspect container {}", handle));
        }

        let inspect: DockerInspect = serde_json::from_slice(&body)
            .with_context(|| format!("Failed to parse inspect output for {}", handle))?;
        Ok(InspectInfo {
            tty: inspect.config.tty,
            state: TargetState::from_label(&inspect.state.status),
        })
    }
}

#[async_trait]
impl ConsoleAttach for DockerEngine {
    async fn open_log_stream(&self, handle: &str, tail: &str) -> Result<LogStream> {
        validate_handle(handle)?;
        validate_tail(tail)?;
        let path = format!(
            "/containers/{}/logs?stdout=1&stderr=1&follow=1&tail={}",
            handle, tail
        );

        let response = self.send(Method::GET, &path, false).await?;
        let status = response.status();
        if status != StatusCode::OK {
            let body = read_body(response).await.unwrap_or_default();
            return Err(api_error(status, &body))
                .with_context(|| format!("Failed to open logs for {}", handle));
        }

        let chunks = response
            .into_body()
            .into_data_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        Ok(Box::new(StreamReader::new(chunks)))
    }

    async fn open_attached_input(&self, handle: &str) -> Result<AttachedInput> {
        validate_handle(handle)?;
        let path = format!("/containers/{}/attach?stream=1&stdin=1", handle);

        let mut response = self.send(Method::POST, &path, true).await?;
        let status = response.status();
        if status != StatusCode::SWITCHING_PROTOCOLS {
            let body = read_body(response).await.unwrap_or_default();
            return Err(api_error(status, &body))
                .with_context(|| format!("Failed to attach to {}", handle));
        }

        let upgraded = hyper::upgrade::on(&mut response)
            .await
            .with_context(|| format!("Failed to upgrade attach connection for {}", handle))?;
        Ok(Box::new(TokioIo::new(upgraded)))
    }
}

async fn read_body(response: Response<Incoming>) -> Result<Bytes> {
    Ok(response
        .into_body()
        .collect()
        .await
        .context("Failed to read Docker response")?
        .to_bytes())
}

/// Docker reports failures as `{"message": "..."}`
fn api_error(status: StatusCode, body: &[u8]) -> anyhow::Error {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: String,
    }

    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(err) => anyhow!("Docker API error ({}): {}", status.as_u16(), err.message),
        Err(_) => anyhow!(
            "Docker API error ({}): {}",
            status.as_u16(),
            String::from_utf8_lossy(body).trim()
        ),
    }
}

/// Container ids and names only; anything else would alter the request path
fn validate_handle(handle: &str) -> Result<()> {
    let valid = !handle.is_empty()
        && handle
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !valid {
        bail!("Invalid container handle: {:?}", handle);
    }
    Ok(())
}

fn validate_tail(tail: &str) -> Result<()> {
    if tail == "all" || (!tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit())) {
        Ok(())
    } else {
        bail!("Invalid log tail: {:?}", tail)
    }
}

/// Response of `GET /containers/{id}/stats?stream=false`
#[derive(Debug, Deserialize)]
struct DockerStats {
    #[serde(default)]
    cpu_stats: DockerCpuStats,
    #[serde(default)]
    precpu_stats: DockerCpuStats,
    #[serde(default)]
    memory_stats: DockerMemoryStats,
    #[serde(default)]
    networks: Option<HashMap<String, DockerNetworkStats>>,
    #[serde(default)]
    blkio_stats: DockerBlkioStats,
}

#[derive(Debug, Default, Deserialize)]
struct DockerCpuStats {
    #[serde(default)]
    cpu_usage: DockerCpuUsage,
    #[serde(default)]
    system_cpu_usage: Option<u64>,
    #[serde(default)]
    online_cpus: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerCpuUsage {
    #[serde(default)]
    total_usage: u64,
}

#[derive(Debug, Default, Deserialize)]
struct DockerMemoryStats {
    #[serde(default)]
    usage: u64,
    #[serde(default)]
    limit: u64,
}

#[derive(Debug, Default, Deserialize)]
struct DockerNetworkStats {
    #[serde(default)]
    rx_bytes: u64,
    #[serde(default)]
    tx_bytes: u64,
}

#[derive(Debug, Default, Deserialize)]
struct DockerBlkioStats {
    #[serde(default)]
    io_service_bytes_recursive: Option<Vec<DockerBlkioEntry>>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerBlkioEntry {
    #[serde(default)]
    op: String,
    #[serde(default)]
    value: u64,
}

impl DockerStats {
    fn into_snapshot(self) -> StatsSnapshot {
        let counters = |cpu: &DockerCpuStats| CpuCounters {
            total_usage: cpu.cpu_usage.total_usage,
            system_usage: cpu.system_cpu_usage.unwrap_or(0),
        };

        let networks = self
            .networks
            .unwrap_or_default()
            .into_iter()
            .map(|(name, net)| {
                (
                    name,
                    NetworkCounters {
                        rx_bytes: net.rx_bytes,
                        tx_bytes: net.tx_bytes,
                    },
                )
            })
            .collect();

        let disk_bytes = self
            .blkio_stats
            .io_service_bytes_recursive
            .unwrap_or_default()
            .iter()
            .filter(|e| e.op.eq_ignore_ascii_case("read") || e.op.eq_ignore_ascii_case("write"))
            .fold(0u64, |acc, e| acc.saturating_add(e.value));

        StatsSnapshot {
            cpu: counters(&self.cpu_stats),
            precpu: counters(&self.precpu_stats),
            online_cpus: self.cpu_stats.online_cpus.unwrap_or(0),
            memory_usage: self.memory_stats.usage,
            memory_limit: self.memory_stats.limit,
            networks,
            disk_bytes,
        }
    }
}

/// The parts of `GET /containers/{id}/json` the agent reads
#[derive(Debug, Deserialize)]
struct DockerInspect {
    #[serde(rename = "Config", default)]
    config: DockerInspectConfig,
    #[serde(rename = "State", default)]
    state: DockerInspectState,
}

#[derive(Debug, Default, Deserialize)]
struct DockerInspectConfig {
    #[serde(rename = "Tty", default)]
    tty: bool,
}

#[derive(Debug, Default, Deserialize)]
struct DockerInspectState {
    #[serde(rename = "Status", default)]
    status: String,
}
