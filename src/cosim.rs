//! Co-simulation link (C7): a priority command queue executed against an
//! external co-simulation engine, plus a loopback TCP listener for live
//! streaming updates (§4.7). Grounded on the NUL-byte-delimited TCP framing
//! and engine-poll pattern of the MATLAB integration this module generalizes.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strum::Display;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::EngineEvent;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Simulation,
    CodeGeneration,
    ModelGeneration,
    General,
    Test,
    Validation,
}

#[derive(Debug, Clone)]
pub struct CoSimCommand {
    pub payload: String,
    pub kind: CommandKind,
    pub timeout_ms: u64,
    pub priority: Priority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub metadata: HashMap<String, String>,
}

impl CoSimCommand {
    pub fn new(payload: impl Into<String>, kind: CommandKind, priority: Priority) -> Self {
        Self {
            payload: payload.into(),
            kind,
            timeout_ms: 5_000,
            priority,
            retry_count: 0,
            max_retries: 2,
            metadata: HashMap::new(),
        }
    }
}

struct QueueEntry {
    seq: u64,
    command: CoSimCommand,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.command.priority == other.command.priority && self.seq == other.seq
    }
}
impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Higher priority first; within a priority, lower seq (older) first.
        self.command
            .priority
            .cmp(&other.command.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Busy,
    Error,
    Reconnecting,
    ShuttingDown,
}

pub struct CommandOutcome {
    pub success: bool,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

/// Capability interface for the external co-simulation engine. The runtime
/// has no concrete backend (MATLAB/Simulink integration is out of scope);
/// callers provide one.
pub trait CommandExecutor: Send + Sync + 'static {
    fn execute(&self, command: &CoSimCommand) -> Result<CommandOutcome, String>;
    fn probe(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct CoSimLinkConfig {
    pub tcp_port: u16,
    pub health_probe_interval: Duration,
    pub health_failure_threshold: u32,
    pub retry_delay: Duration,
}

impl Default for CoSimLinkConfig {
    fn default() -> Self {
        Self {
            tcp_port: 30_000,
            health_probe_interval: Duration::from_secs(10),
            health_failure_threshold: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub uptime: Duration,
    pub last_probe_ok: bool,
    pub consecutive_probe_failures: u32,
    pub recent_latencies_ms: VecDeque<u64>,
    pub success_count: u64,
    pub failure_count: u64,
    pub queue_depth: usize,
    pub current_kind: Option<CommandKind>,
}

impl Diagnostics {
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f64 / total as f64
        }
    }
}

struct Shared {
    queue: Mutex<BinaryHeap<QueueEntry>>,
    notify: Notify,
    seq: AtomicU64,
    state: Mutex<LinkState>,
    diagnostics: Mutex<Diagnostics>,
    started_at: Instant,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    executor: Arc<dyn CommandExecutor>,
}

pub struct CoSimLink {
    shared: Arc<Shared>,
    config: CoSimLinkConfig,
    cancel: CancellationToken,
    worker: Option<tokio::task::JoinHandle<()>>,
    health: Option<tokio::task::JoinHandle<()>>,
    tcp: Option<tokio::task::JoinHandle<()>>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
}

const RECENT_LATENCY_WINDOW: usize = 20;

impl CoSimLink {
    pub fn new(executor: Arc<dyn CommandExecutor>, config: CoSimLinkConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            queue: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            state: Mutex::new(LinkState::Disconnected),
            diagnostics: Mutex::new(Diagnostics {
                uptime: Duration::ZERO,
                last_probe_ok: false,
                consecutive_probe_failures: 0,
                recent_latencies_ms: VecDeque::new(),
                success_count: 0,
                failure_count: 0,
                queue_depth: 0,
                current_kind: None,
            }),
            started_at: Instant::now(),
            events_tx,
            executor,
        });
        Self {
            shared,
            config,
            cancel: CancellationToken::new(),
            worker: None,
            health: None,
            tcp: None,
            events_rx,
        }
    }

    pub fn try_recv_event(&mut self) -> Option<EngineEvent> {
        self.events_rx.try_recv().ok()
    }

    /// Starts the worker, health monitor, and TCP streaming listener tasks.
    pub async fn start(&mut self) {
        *self.shared.state.lock().await = LinkState::Connecting;

        self.worker = Some(tokio::spawn(Self::run_worker(self.shared.clone(), self.cancel.clone(), self.config)));
        self.health = Some(tokio::spawn(Self::run_health_monitor(self.shared.clone(), self.cancel.clone(), self.config)));

        match TcpListener::bind(("127.0.0.1", self.config.tcp_port)).await {
            Ok(listener) => {
                *self.shared.state.lock().await = LinkState::Connected;
                self.tcp = Some(tokio::spawn(Self::run_tcp_listener(listener, self.shared.clone(), self.cancel.clone())));
            }
            Err(e) => {
                warn!("failed to bind co-sim TCP listener: {e}");
                *self.shared.state.lock().await = LinkState::Error;
            }
        }
    }

    /// Enqueues `command`, unless the link is in `Error` (§4.7 Failure and
    /// recovery), in which case it is failed immediately rather than queued.
    pub async fn submit(&self, command: CoSimCommand) -> EngineResult<()> {
        if *self.shared.state.lock().await == LinkState::Error {
            return Err(EngineError::EngineUnavailable);
        }

        let seq = self.shared.seq.fetch_add(1, Ordering::SeqCst);
        let mut queue = self.shared.queue.lock().await;
        queue.push(QueueEntry { seq, command });
        self.shared.diagnostics.lock().await.queue_depth = queue.len();
        drop(queue);
        self.shared.notify.notify_one();
        Ok(())
    }

    pub async fn state(&self) -> LinkState {
        *self.shared.state.lock().await
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        let mut d = self.shared.diagnostics.lock().await.clone();
        d.uptime = self.shared.started_at.elapsed();
        d
    }

    /// Gracefully tears down the worker, health monitor, and TCP listener,
    /// waiting up to `timeout` before giving up.
    pub async fn shutdown(&mut self, timeout: Duration) {
        *self.shared.state.lock().await = LinkState::ShuttingDown;
        self.cancel.cancel();
        self.shared.notify.notify_waiters();

        let handles = [self.worker.take(), self.health.take(), self.tcp.take()];
        for handle in handles.into_iter().flatten() {
            let _ = tokio::time::timeout(timeout, handle).await;
        }
        *self.shared.state.lock().await = LinkState::Disconnected;
    }

    async fn run_worker(shared: Arc<Shared>, cancel: CancellationToken, config: CoSimLinkConfig) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = shared.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }

            loop {
                let entry = {
                    let mut queue = shared.queue.lock().await;
                    let entry = queue.pop();
                    shared.diagnostics.lock().await.queue_depth = queue.len();
                    entry
                };
                let Some(entry) = entry else { break };
                if cancel.is_cancelled() {
                    return;
                }
                Self::execute_one(&shared, &cancel, config, entry.command).await;
            }
        }
    }

    async fn execute_one(
        shared: &Arc<Shared>,
        cancel: &CancellationToken,
        config: CoSimLinkConfig,
        mut command: CoSimCommand,
    ) {
        *shared.state.lock().await = LinkState::Busy;
        shared.diagnostics.lock().await.current_kind = Some(command.kind);

        let start = Instant::now();
        let executor = shared.executor.clone();
        let payload_for_exec = command.clone();
        let result = tokio::time::timeout(
            Duration::from_millis(command.timeout_ms),
            tokio::task::spawn_blocking(move || executor.execute(&payload_for_exec)),
        )
        .await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        {
            let mut diag = shared.diagnostics.lock().await;
            diag.recent_latencies_ms.push_back(elapsed_ms);
            if diag.recent_latencies_ms.len() > RECENT_LATENCY_WINDOW {
                diag.recent_latencies_ms.pop_front();
            }
            diag.current_kind = None;
        }

        *shared.state.lock().await = LinkState::Connected;

        match result {
            Ok(Ok(Ok(outcome))) => {
                shared.diagnostics.lock().await.success_count += 1;
                let kind_label = command.kind.to_string();

                let state_at_completion = *shared.state.lock().await;
                let queue_depth = shared.diagnostics.lock().await.queue_depth;
                let timestamp_ms = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_millis())
                    .unwrap_or(0);
                let mut metadata = command.metadata.clone();
                metadata.insert("execution_timestamp_ms".to_string(), timestamp_ms.to_string());
                metadata.insert("link_state".to_string(), format!("{state_at_completion:?}"));
                metadata.insert("queue_depth".to_string(), queue_depth.to_string());

                let _ = shared.events_tx.send(EngineEvent::CommandCompleted {
                    success: outcome.success,
                    message: outcome.message,
                    data: outcome.data,
                    kind: kind_label,
                    metadata,
                });

                if outcome.success && command.kind == CommandKind::ModelGeneration {
                    let mut instantiate = CoSimCommand::new("instantiate", CommandKind::General, Priority::Critical);
                    instantiate.metadata = command.metadata.clone();
                    let seq = shared.seq.fetch_add(1, Ordering::SeqCst);
                    shared.queue.lock().await.push(QueueEntry { seq, command: instantiate });

                    let mut streaming = CoSimCommand::new("setup_streaming", CommandKind::General, Priority::High);
                    streaming.metadata = command.metadata.clone();
                    let seq = shared.seq.fetch_add(1, Ordering::SeqCst);
                    shared.queue.lock().await.push(QueueEntry { seq, command: streaming });

                    shared.notify.notify_one();
                }
            }
            Ok(Ok(Err(message))) => {
                Self::handle_failure(shared, cancel, config, &mut command, message).await;
            }
            Ok(Err(_join_err)) => {
                Self::handle_failure(shared, cancel, config, &mut command, "execution task panicked".to_string()).await;
            }
            Err(_elapsed) => {
                Self::handle_failure(shared, cancel, config, &mut command, "command timed out".to_string()).await;
            }
        }
    }

    async fn handle_failure(
        shared: &Arc<Shared>,
        cancel: &CancellationToken,
        config: CoSimLinkConfig,
        command: &mut CoSimCommand,
        message: String,
    ) {
        shared.diagnostics.lock().await.failure_count += 1;

        if command.retry_count < command.max_retries {
            command.retry_count += 1;
            let retry_command = command.clone();
            let shared = shared.clone();
            let cancel = cancel.clone();
            let delay = config.retry_delay;
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        let seq = shared.seq.fetch_add(1, Ordering::SeqCst);
                        shared.queue.lock().await.push(QueueEntry { seq, command: retry_command });
                        shared.notify.notify_one();
                    }
                }
            });
        } else {
            let kind_label = command.kind.to_string();
            let _ = shared.events_tx.send(EngineEvent::CommandFailed { reason: message, kind: kind_label });
        }
    }

    async fn run_health_monitor(shared: Arc<Shared>, cancel: CancellationToken, config: CoSimLinkConfig) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(config.health_probe_interval) => {}
            }
            let executor = shared.executor.clone();
            let ok = tokio::task::spawn_blocking(move || executor.probe()).await.unwrap_or(false);

            let mut diag = shared.diagnostics.lock().await;
            diag.last_probe_ok = ok;
            if ok {
                diag.consecutive_probe_failures = 0;
            } else {
                diag.consecutive_probe_failures += 1;
            }
            let should_mark_error = diag.consecutive_probe_failures >= config.health_failure_threshold;
            drop(diag);

            if should_mark_error {
                let mut state = shared.state.lock().await;
                if *state != LinkState::ShuttingDown {
                    *state = LinkState::Reconnecting;
                    warn!("co-sim health probe failed {} times consecutively", config.health_failure_threshold);
                }
            }
        }
    }

    /// Accepts a single connection at a time, splitting its byte stream on
    /// NUL bytes into discrete messages (matches the original Simulink
    /// streaming wire format), decoding permissively as UTF-8.
    async fn run_tcp_listener(listener: TcpListener, shared: Arc<Shared>, cancel: CancellationToken) {
        info!("co-sim TCP listener bound");
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => return,
                result = listener.accept() => result,
            };
            let Ok((mut stream, addr)) = accepted else { continue };
            info!(%addr, "co-sim TCP connection established");

            let mut buffer = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let read = tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    result = stream.read(&mut chunk) => result,
                };
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        buffer.extend_from_slice(&chunk[..n]);
                        while let Some(pos) = buffer.iter().position(|b| *b == 0) {
                            let message: Vec<u8> = buffer.drain(..=pos).collect();
                            let text = String::from_utf8_lossy(&message[..message.len() - 1]).to_string();
                            if !text.is_empty() {
                                let _ = shared.events_tx.send(EngineEvent::CoSimLiveUpdate(text));
                            }
                        }
                    }
                    Err(e) => {
                        warn!("co-sim TCP read error: {e}");
                        break;
                    }
                }
            }
        }
    }
}
