//! HTTP API: health, metrics, server stats and console WebSockets

use agent_lib::{
    collector::{SampleConduit, TelemetryCollector},
    console::{ConsoleBridge, ConsoleError, ConsoleInput, ConsoleOutput},
    health::{ComponentStatus, HealthRegistry},
    observability::AgentMetrics,
    store::SampleStore,
};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::{Bytes, BytesMut};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: AgentMetrics,
    pub collector: Arc<TelemetryCollector>,
    pub samples: Arc<dyn SampleStore>,
    pub console: ConsoleBridge,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        metrics: AgentMetrics,
        collector: Arc<TelemetryCollector>,
        samples: Arc<dyn SampleStore>,
        console: ConsoleBridge,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            collector,
            samples,
            console,
        }
    }
}

/// Rejected `period` query value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeriodError {
    #[error("period is empty")]
    Empty,

    #[error("period {0:?} must be a number followed by s, m, h or d")]
    Malformed(String),

    #[error("period {0:?} must be positive")]
    NotPositive(String),
}

/// Parse a look-back period such as `90s`, `30m`, `6h` or `1d`
pub fn parse_period(period: &str) -> Result<chrono::Duration, PeriodError> {
    let period = period.trim();
    if period.is_empty() {
        return Err(PeriodError::Empty);
    }

    let malformed = || PeriodError::Malformed(period.to_string());
    let split = period.len() - 1;
    if !period.is_char_boundary(split) {
        return Err(malformed());
    }
    let (amount, unit) = period.split_at(split);
    let amount: i64 = amount.parse().map_err(|_| malformed())?;
    if amount <= 0 {
        return Err(PeriodError::NotPositive(period.to_string()));
    }

    let duration = match unit {
        "s" => chrono::Duration::try_seconds(amount),
        "m" => chrono::Duration::try_minutes(amount),
        "h" => chrono::Duration::try_hours(amount),
        "d" => chrono::Duration::try_days(amount),
        _ => return Err(malformed()),
    };
    duration.ok_or_else(malformed)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// Health check response - returns 200 if healthy or degraded, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics");
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Latest sample: cache first, then the store
async fn latest_stats(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    if let Some(sample) = state.collector.latest(&id).await {
        return Json(sample).into_response();
    }

    match state.samples.latest_sample(&id).await {
        Ok(Some(sample)) => Json(sample).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "no stats available"),
        Err(e) => {
            error!(target_id = %id, error = %e, "Failed to query latest stats");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to query stats")
        }
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    period: Option<String>,
}

async fn stats_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let period = query.period.unwrap_or_else(|| "1h".to_string());
    let duration = match parse_period(&period) {
        Ok(duration) => duration,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("invalid period: {}", e)),
    };

    let since = chrono::Utc::now() - duration;
    match state.samples.samples_since(&id, since).await {
        Ok(samples) => Json(samples).into_response(),
        Err(e) => {
            error!(target_id = %id, error = %e, "Failed to query stats history");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to query stats")
        }
    }
}

async fn live_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| stream_live_stats(socket, state, id))
}

async fn stream_live_stats(socket: WebSocket, state: Arc<AppState>, target_id: String) {
    let mut conduit = state.collector.subscribe(&target_id).await;
    debug!(target_id = %target_id, "Live stats subscriber connected");

    pump_live_stats(socket, &state, &target_id, &mut conduit).await;

    state.collector.unsubscribe(&target_id, &conduit).await;
    debug!(target_id = %target_id, "Live stats subscriber disconnected");
}

/// Send the cached sample, then every new one, until the client leaves
async fn pump_live_stats(
    socket: WebSocket,
    state: &AppState,
    target_id: &str,
    conduit: &mut SampleConduit,
) {
    let (mut sender, mut receiver) = socket.split();

    if let Some(latest) = state.collector.latest(target_id).await {
        if send_json(&mut sender, &latest).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            sample = conduit.recv() => {
                let Some(sample) = sample else { break };
                if send_json(&mut sender, &sample).await.is_err() {
                    break;
                }
            }
            message = receiver.next() => match message {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn send_json<T: serde::Serialize>(
    sender: &mut SplitSink<WebSocket, Message>,
    value: &T,
) -> anyhow::Result<()> {
    let text = serde_json::to_string(value)?;
    sender.send(Message::Text(text)).await?;
    Ok(())
}

fn console_rejection(error: &ConsoleError) -> Response {
    let status = match error {
        ConsoleError::TargetNotFound(_) => StatusCode::NOT_FOUND,
        ConsoleError::NoRuntimeHandle(_) => StatusCode::CONFLICT,
        ConsoleError::Inspect { .. } => StatusCode::BAD_GATEWAY,
        ConsoleError::Lookup { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, error.to_string())
}

async fn console(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let session = match state.console.prepare(&id).await {
        Ok(session) => session,
        Err(e) => return console_rejection(&e),
    };

    let Some(ws) = ws else {
        return error_response(StatusCode::BAD_REQUEST, "expected a WebSocket upgrade");
    };

    ws.on_upgrade(move |socket| async move {
        let (sender, receiver) = socket.split();
        let summary = session
            .run(WsConsoleOutput::new(sender), WsConsoleInput(receiver))
            .await;
        debug!(target_id = %id, ?summary, "Console WebSocket closed");
    })
}

/// Turns console output chunks into WebSocket messages.
///
/// Chunks are cut at arbitrary read boundaries, so a character split across
/// two reads is held back until its remaining bytes arrive. Output that is
/// not UTF-8 at all goes out unchanged as a binary frame.
#[derive(Debug, Default)]
struct ConsoleFramer {
    pending: BytesMut,
}

impl ConsoleFramer {
    fn frame(&mut self, chunk: &[u8]) -> Option<Message> {
        self.pending.extend_from_slice(chunk);

        let complete = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            // only the trailing character is cut short
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => return Some(Message::Binary(self.pending.split().to_vec())),
        };
        if complete == 0 {
            return None;
        }

        let text = self.pending.split_to(complete);
        Some(Message::Text(String::from_utf8_lossy(&text).into_owned()))
    }
}

/// Console output as WebSocket text frames
struct WsConsoleOutput {
    sink: SplitSink<WebSocket, Message>,
    framer: ConsoleFramer,
}

impl WsConsoleOutput {
    fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink,
            framer: ConsoleFramer::default(),
        }
    }
}

#[async_trait]
impl ConsoleOutput for WsConsoleOutput {
    async fn send(&mut self, chunk: Bytes) -> anyhow::Result<()> {
        if let Some(message) = self.framer.frame(&chunk) {
            self.sink.send(message).await?;
        }
        Ok(())
    }
}

/// Client frames as console input; control frames are skipped
struct WsConsoleInput(SplitStream<WebSocket>);

#[async_trait]
impl ConsoleInput for WsConsoleInput {
    async fn recv(&mut self) -> Option<anyhow::Result<Bytes>> {
        loop {
            match self.0.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Bytes::from(text))),
                Ok(Message::Binary(data)) => return Some(Ok(Bytes::from(data))),
                Ok(Message::Close(_)) => return None,
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Err(e) => {
                    warn!(error = %e, "Console WebSocket read failed");
                    return Some(Err(e.into()));
                }
            }
        }
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/servers/:id/stats", get(latest_stats))
        .route("/api/v1/servers/:id/stats/history", get(stats_history))
        .route("/api/v1/servers/:id/stats/live", get(live_stats))
        .route("/api/v1/servers/:id/console", get(console))
        .with_state(state)
}

/// Start the API server; returns when `shutdown` resolves
pub async fn serve<F>(port: u16, state: Arc<AppState>, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
