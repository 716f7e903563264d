//! Interactive console sessions
//!
//! A session bridges one client transport to one container: the container's
//! output (followed from a recent tail) flows out, client messages flow in
//! as lines on the container's stdin. Everything that can refuse a session
//! happens in [`ConsoleBridge::prepare`], before any transport upgrade.

pub mod frame;

pub use frame::{
    ConsoleDecoder, FrameError, MultiplexCodec, StreamFrame, StreamKind, MAX_FRAME_SIZE,
};

use crate::observability::{AgentMetrics, StructuredLogger};
use crate::runtime::{AttachedInput, ConsoleAttach, LifecycleControl, LogStream};
use crate::store::TargetStore;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Default number of log lines replayed when a session opens
pub const DEFAULT_LOG_TAIL: &str = "100";

/// Reasons a console session is refused
#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("server {0} not found")]
    TargetNotFound(String),

    #[error("server {0} has no container")]
    NoRuntimeHandle(String),

    #[error("failed to look up server {target_id}")]
    Lookup {
        target_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to inspect container {handle}")]
    Inspect {
        handle: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ConsoleError {
    /// Short label for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            ConsoleError::TargetNotFound(_) => "not_found",
            ConsoleError::NoRuntimeHandle(_) => "no_container",
            ConsoleError::Lookup { .. } => "lookup_failed",
            ConsoleError::Inspect { .. } => "inspect_failed",
        }
    }
}

/// Client-bound half of a console transport
#[async_trait]
pub trait ConsoleOutput: Send {
    async fn send(&mut self, chunk: Bytes) -> Result<()>;
}

/// Container-bound half of a console transport.
/// `None` means the client closed the session.
#[async_trait]
pub trait ConsoleInput: Send {
    async fn recv(&mut self) -> Option<Result<Bytes>>;
}

#[async_trait]
impl ConsoleOutput for mpsc::Sender<Bytes> {
    async fn send(&mut self, chunk: Bytes) -> Result<()> {
        mpsc::Sender::send(self, chunk)
            .await
            .map_err(|_| anyhow!("console client went away"))
    }
}

#[async_trait]
impl ConsoleInput for mpsc::Receiver<Bytes> {
    async fn recv(&mut self) -> Option<Result<Bytes>> {
        mpsc::Receiver::recv(self).await.map(Ok)
    }
}

/// What happened during a session
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Output bytes delivered to the client
    pub bytes_out: u64,
    /// Client messages received (including ones discarded without stdin)
    pub messages_in: u64,
    /// Whether the container's stdin was attached
    pub input_attached: bool,
    /// The log stream could not be opened; the client got one error message
    pub log_stream_failed: bool,
}

/// Configuration for console sessions
#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    /// Log lines to replay on open ("all" for everything)
    pub log_tail: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            log_tail: DEFAULT_LOG_TAIL.to_string(),
        }
    }
}

/// Opens console sessions against managed containers
#[derive(Clone)]
pub struct ConsoleBridge {
    targets: Arc<dyn TargetStore>,
    lifecycle: Arc<dyn LifecycleControl>,
    attach: Arc<dyn ConsoleAttach>,
    config: ConsoleConfig,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl ConsoleBridge {
    pub fn new(
        targets: Arc<dyn TargetStore>,
        lifecycle: Arc<dyn LifecycleControl>,
        attach: Arc<dyn ConsoleAttach>,
        config: ConsoleConfig,
    ) -> Self {
        Self {
            targets,
            lifecycle,
            attach,
            config,
            metrics: AgentMetrics::new(),
            logger: StructuredLogger::new("localhost"),
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Resolve the container and its TTY mode. Any error here means the
    /// session must be refused.
    pub async fn prepare(&self, target_id: &str) -> Result<ConsoleSession, ConsoleError> {
        let result = self.resolve(target_id).await;
        if let Err(e) = &result {
            self.metrics.inc_console_rejections(e.reason());
            self.logger.log_console_rejected(target_id, &e.to_string());
        }
        result
    }

    async fn resolve(&self, target_id: &str) -> Result<ConsoleSession, ConsoleError> {
        let target = self
            .targets
            .lookup_target(target_id)
            .await
            .map_err(|source| ConsoleError::Lookup {
                target_id: target_id.to_string(),
                source,
            })?
            .ok_or_else(|| ConsoleError::TargetNotFound(target_id.to_string()))?;

        let handle = target
            .runtime_handle
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConsoleError::NoRuntimeHandle(target_id.to_string()))?;

        let info = self
            .lifecycle
            .inspect(&handle)
            .await
            .map_err(|source| ConsoleError::Inspect {
                handle: handle.clone(),
                source,
            })?;

        Ok(ConsoleSession {
            target_id: target_id.to_string(),
            handle,
            tty: info.tty,
            attach: Arc::clone(&self.attach),
            log_tail: self.config.log_tail.clone(),
            metrics: self.metrics.clone(),
            logger: self.logger.clone(),
        })
    }

    /// Prepare and run a session over the given transport halves
    pub async fn open_session<O, I>(
        &self,
        target_id: &str,
        output: O,
        input: I,
    ) -> Result<SessionSummary, ConsoleError>
    where
        O: ConsoleOutput,
        I: ConsoleInput,
    {
        let session = self.prepare(target_id).await?;
        Ok(session.run(output, input).await)
    }
}

/// A prepared session, ready to be bridged to a transport
pub struct ConsoleSession {
    target_id: String,
    handle: String,
    tty: bool,
    attach: Arc<dyn ConsoleAttach>,
    log_tail: String,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl std::fmt::Debug for ConsoleSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleSession")
            .field("target_id", &self.target_id)
            .field("handle", &self.handle)
            .field("tty", &self.tty)
            .finish()
    }
}

impl ConsoleSession {
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn tty(&self) -> bool {
        self.tty
    }

    /// Pump until either side ends; returns once both pumps have stopped
    pub async fn run<O, I>(self, mut output: O, mut input: I) -> SessionSummary
    where
        O: ConsoleOutput,
        I: ConsoleInput,
    {
        let started = Instant::now();
        let mut summary = SessionSummary::default();

        let logs = match self.attach.open_log_stream(&self.handle, &self.log_tail).await {
            Ok(logs) => logs,
            Err(e) => {
                warn!(target_id = %self.target_id, error = %e, "Failed to open console log stream");
                let message = format!("Error: {:#}", e);
                if let Err(e) = output.send(Bytes::from(message)).await {
                    debug!(error = %e, "Console client closed before error was delivered");
                }
                summary.log_stream_failed = true;
                return summary;
            }
        };

        let attached = match self.attach.open_attached_input(&self.handle).await {
            Ok(writer) => Some(writer),
            Err(e) => {
                warn!(
                    target_id = %self.target_id,
                    error = %e,
                    "Failed to attach console input, session is output-only"
                );
                None
            }
        };
        summary.input_attached = attached.is_some();

        self.metrics.console_session_opened();
        self.logger
            .log_console_opened(&self.target_id, &self.handle, self.tty);

        let token = CancellationToken::new();
        let frames = FramedRead::new(logs, ConsoleDecoder::for_tty(self.tty));

        let (bytes_out, messages_in) = tokio::join!(
            pump_output(frames, &mut output, token.clone()),
            pump_input(&mut input, attached, token.clone()),
        );
        summary.bytes_out = bytes_out;
        summary.messages_in = messages_in;

        self.metrics.console_session_closed();
        self.logger.log_console_closed(
            &self.target_id,
            bytes_out,
            messages_in,
            started.elapsed().as_secs_f64(),
        );

        summary
    }
}

/// Forward container output to the client until either side ends
async fn pump_output<O>(
    mut frames: FramedRead<LogStream, ConsoleDecoder>,
    output: &mut O,
    token: CancellationToken,
) -> u64
where
    O: ConsoleOutput,
{
    let _cancel_peer = token.clone().drop_guard();
    let mut bytes_out = 0u64;

    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = frames.next() => next,
        };

        match next {
            None => {
                debug!("Console log stream ended");
                break;
            }
            Some(Err(e)) => {
                error!(error = %e, "Console log stream failed");
                break;
            }
            Some(Ok(chunk)) => {
                let len = chunk.len() as u64;
                if let Err(e) = output.send(chunk).await {
                    debug!(error = %e, "Console client stopped receiving");
                    break;
                }
                bytes_out += len;
            }
        }
    }

    bytes_out
}

/// Write client messages to the container's stdin, one line each
async fn pump_input<I>(
    input: &mut I,
    mut attached: Option<AttachedInput>,
    token: CancellationToken,
) -> u64
where
    I: ConsoleInput,
{
    let _cancel_peer = token.clone().drop_guard();
    let mut messages_in = 0u64;

    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = input.recv() => next,
        };

        let message = match next {
            None => {
                debug!("Console client closed");
                break;
            }
            Some(Err(e)) => {
                debug!(error = %e, "Console client read failed");
                break;
            }
            Some(Ok(message)) => message,
        };
        messages_in += 1;

        let Some(writer) = attached.as_mut() else {
            continue;
        };
        if let Err(e) = write_line(writer, &message).await {
            warn!(error = %e, "Failed to write console input");
            break;
        }
    }

    if let Some(mut writer) = attached {
        if let Err(e) = writer.shutdown().await {
            debug!(error = %e, "Failed to close console input");
        }
    }

    messages_in
}

async fn write_line(writer: &mut AttachedInput, message: &[u8]) -> std::io::Result<()> {
    let mut line = Vec::with_capacity(message.len() + 1);
    line.extend_from_slice(message);
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InspectInfo, Target, TargetState};
    use crate::store::SqliteStore;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};

    /// Lifecycle stub reporting a fixed TTY mode, or failing inspection
    struct Inspector {
        tty: bool,
        fail: bool,
    }

    #[async_trait]
    impl LifecycleControl for Inspector {
        async fn start(&self, _handle: &str) -> Result<()> {
            Ok(())
        }

        async fn stop(&self, _handle: &str) -> Result<()> {
            Ok(())
        }

        async fn restart(&self, _handle: &str) -> Result<()> {
            Ok(())
        }

        async fn inspect(&self, handle: &str) -> Result<InspectInfo> {
            if self.fail {
                anyhow::bail!("no such container: {}", handle);
            }
            Ok(InspectInfo {
                tty: self.tty,
                state: TargetState::Running,
            })
        }
    }

    /// Attach stub handing out pre-built streams once
    #[derive(Default)]
    struct ScriptedAttach {
        logs: Mutex<Option<LogStream>>,
        input: Mutex<Option<AttachedInput>>,
        tails: Mutex<Vec<String>>,
    }

    impl ScriptedAttach {
        fn new(logs: Option<LogStream>, input: Option<AttachedInput>) -> Self {
            Self {
                logs: Mutex::new(logs),
                input: Mutex::new(input),
                tails: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ConsoleAttach for ScriptedAttach {
        async fn open_log_stream(&self, _handle: &str, tail: &str) -> Result<LogStream> {
            self.tails.lock().unwrap().push(tail.to_string());
            self.logs
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| anyhow!("logs unavailable"))
        }

        async fn open_attached_input(&self, _handle: &str) -> Result<AttachedInput> {
            self.input
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| anyhow!("attach refused"))
        }
    }

    async fn store() -> Arc<SqliteStore> {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        for (id, handle) in [("mc", Some("c-mc")), ("bare", None)] {
            store
                .put_target(&Target {
                    id: id.to_string(),
                    runtime_handle: handle.map(str::to_string),
                    state: TargetState::Running,
                })
                .await
                .unwrap();
        }
        store
    }

    async fn bridge(tty: bool, attach: Arc<ScriptedAttach>) -> ConsoleBridge {
        ConsoleBridge::new(
            store().await,
            Arc::new(Inspector { tty, fail: false }),
            attach,
            ConsoleConfig::default(),
        )
    }

    fn mock_logs(bytes: &[u8]) -> LogStream {
        Box::new(tokio_test::io::Builder::new().read(bytes).build())
    }

    async fn drain(mut rx: mpsc::Receiver<Bytes>) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.push(chunk);
        }
        out
    }

    #[tokio::test]
    async fn test_prepare_rejects_unknown_and_handleless_targets() {
        let bridge = bridge(false, Arc::new(ScriptedAttach::default())).await;

        assert!(matches!(
            bridge.prepare("ghost").await,
            Err(ConsoleError::TargetNotFound(_))
        ));
        assert!(matches!(
            bridge.prepare("bare").await,
            Err(ConsoleError::NoRuntimeHandle(_))
        ));
    }

    #[tokio::test]
    async fn test_prepare_rejects_when_inspect_fails() {
        let bridge = ConsoleBridge::new(
            store().await,
            Arc::new(Inspector {
                tty: false,
                fail: true,
            }),
            Arc::new(ScriptedAttach::default()),
            ConsoleConfig::default(),
        );

        let err = bridge.prepare("mc").await.unwrap_err();
        assert_eq!(err.reason(), "inspect_failed");
    }

    #[tokio::test]
    async fn test_multiplexed_output_is_demultiplexed() {
        let mut logs = vec![1, 0, 0, 0, 0, 0, 0, 5];
        logs.extend_from_slice(b"hello");
        logs.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 0]);
        logs.extend_from_slice(&[2, 0, 0, 0, 0, 0, 0, 3]);
        logs.extend_from_slice(b"err");

        let (_stdin_client, stdin_server) = tokio::io::duplex(64);
        let attach = Arc::new(ScriptedAttach::new(
            Some(mock_logs(&logs)),
            Some(Box::new(stdin_server)),
        ));
        let bridge = bridge(false, attach.clone()).await;

        let (out_tx, out_rx) = mpsc::channel(8);
        let (_in_tx, in_rx) = mpsc::channel::<Bytes>(8);

        let session = bridge.prepare("mc").await.unwrap();
        assert!(!session.tty());
        assert_eq!(session.handle(), "c-mc");

        let summary = session.run(out_tx, in_rx).await;
        assert_eq!(summary.bytes_out, 8);
        assert!(summary.input_attached);
        assert_eq!(
            drain(out_rx).await,
            vec![Bytes::from("hello"), Bytes::from("err")]
        );
        assert_eq!(*attach.tails.lock().unwrap(), vec!["100"]);
    }

    #[tokio::test]
    async fn test_tty_output_is_forwarded_verbatim() {
        let raw = [1u8, 0, 0, 0, 0, 0, 0, 2, b'h', b'i'];
        let attach = Arc::new(ScriptedAttach::new(Some(mock_logs(&raw)), None));
        let bridge = bridge(true, attach).await;

        let (out_tx, out_rx) = mpsc::channel(8);
        let (_in_tx, in_rx) = mpsc::channel::<Bytes>(8);

        let summary = bridge.open_session("mc", out_tx, in_rx).await.unwrap();
        assert_eq!(summary.bytes_out, raw.len() as u64);

        let joined: Vec<u8> = drain(out_rx)
            .await
            .into_iter()
            .flat_map(|c| c.to_vec())
            .collect();
        assert_eq!(joined, raw);
    }

    #[tokio::test]
    async fn test_client_messages_become_stdin_lines() {
        // keep the log stream open until the client leaves
        let (_log_writer, log_reader) = tokio::io::duplex(64);
        let (stdin_writer, mut stdin_reader): (DuplexStream, DuplexStream) =
            tokio::io::duplex(256);
        let attach = Arc::new(ScriptedAttach::new(
            Some(Box::new(log_reader)),
            Some(Box::new(stdin_writer)),
        ));
        let bridge = bridge(false, attach).await;

        let (out_tx, _out_rx) = mpsc::channel(8);
        let (in_tx, in_rx) = mpsc::channel(8);
        in_tx.send(Bytes::from("say hello")).await.unwrap();
        in_tx.send(Bytes::from("stop")).await.unwrap();
        drop(in_tx);

        let summary = tokio::time::timeout(
            Duration::from_secs(5),
            bridge.open_session("mc", out_tx, in_rx),
        )
        .await
        .expect("session should end when the client closes")
        .unwrap();
        assert_eq!(summary.messages_in, 2);

        let mut written = String::new();
        stdin_reader.read_to_string(&mut written).await.unwrap();
        assert_eq!(written, "say hello\nstop\n");
    }

    #[tokio::test]
    async fn test_log_stream_failure_sends_one_error_message() {
        let attach = Arc::new(ScriptedAttach::new(None, None));
        let bridge = bridge(false, attach).await;

        let (out_tx, out_rx) = mpsc::channel(8);
        let (_in_tx, in_rx) = mpsc::channel::<Bytes>(8);

        let summary = bridge.open_session("mc", out_tx, in_rx).await.unwrap();
        assert!(summary.log_stream_failed);

        let messages = drain(out_rx).await;
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with(b"Error: "));
    }

    #[tokio::test]
    async fn test_attach_failure_leaves_session_output_only() {
        let (log_writer, log_reader) = tokio::io::duplex(64);
        let attach = Arc::new(ScriptedAttach::new(Some(Box::new(log_reader)), None));
        let bridge = bridge(true, attach).await;

        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (in_tx, in_rx) = mpsc::channel(8);

        let session = tokio::spawn(async move { bridge.open_session("mc", out_tx, in_rx).await });

        in_tx.send(Bytes::from("ignored")).await.unwrap();
        let mut log_writer = log_writer;
        log_writer.write_all(b"server ready").await.unwrap();
        assert_eq!(out_rx.recv().await.unwrap(), Bytes::from("server ready"));

        drop(log_writer);
        let summary = tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .expect("session should end with the log stream")
            .unwrap()
            .unwrap();
        assert!(!summary.input_attached);
        assert_eq!(summary.bytes_out, 12);
    }

    #[tokio::test]
    async fn test_truncated_frame_ends_session() {
        let mut logs = vec![1, 0, 0, 0, 0, 0, 0, 2, b'o', b'k'];
        logs.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 9, b'x']);
        let (_stdin_client, stdin_server) = tokio::io::duplex(64);
        let attach = Arc::new(ScriptedAttach::new(
            Some(mock_logs(&logs)),
            Some(Box::new(stdin_server)),
        ));
        let bridge = bridge(false, attach).await;

        let (out_tx, out_rx) = mpsc::channel(8);
        let (_in_tx, in_rx) = mpsc::channel::<Bytes>(8);

        let summary = bridge.open_session("mc", out_tx, in_rx).await.unwrap();
        assert_eq!(summary.bytes_out, 2);
        assert_eq!(drain(out_rx).await, vec![Bytes::from("ok")]);
    }
}
