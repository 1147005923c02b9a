//! Hardware link (C6): a line-oriented serial connection to physical or
//! simulated hardware, run on a dedicated worker task (§4.6).
//!
//! No serial-port crate appears anywhere in the reference corpus, so the
//! transport itself is abstracted behind [`SerialTransport`]; callers supply
//! a concrete implementation (or [`tests::InMemoryTransport`] for testing).

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::EngineEvent;

const RECONNECT_INTERVAL: Duration = Duration::from_secs(3);
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Capability interface for a line-oriented serial connection. Backends are
/// swapped in, not subclassed (Design Notes "Inheritance / duck-typing").
pub trait SerialTransport: Send {
    /// Blocks for at most `timeout`, returning `Ok(None)` on a pure timeout
    /// with no data available (mirrors `pyserial`'s `timeout=1` semantics).
    fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>>;
    fn write_line(&mut self, line: &str) -> io::Result<()>;
}

/// Opens transports and enumerates ports for a given backend.
pub trait SerialTransportFactory: Send + Sync + 'static {
    fn open(&self, port: &str) -> io::Result<Box<dyn SerialTransport>>;
    fn list_ports(&self) -> Vec<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Lost,
}

#[derive(Debug, Clone, Copy)]
pub struct HardwareLinkConfig {
    pub reconnect_interval: Duration,
    pub read_timeout: Duration,
}

impl Default for HardwareLinkConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: RECONNECT_INTERVAL,
            read_timeout: READ_TIMEOUT,
        }
    }
}

fn parse_incoming_line(line: &str) -> Option<EngineEvent> {
    let parts: Vec<&str> = line.splitn(3, ':').collect();
    if parts.len() < 2 {
        return None;
    }
    match parts[0] {
        "EVT" => Some(EngineEvent::HardwareEvent(parts[1].to_string())),
        "DATA" => {
            let payload = parts.get(2)?;
            let value: f64 = payload.parse().ok()?;
            Some(EngineEvent::HardwareData(parts[1].to_string(), value))
        }
        _ => None,
    }
}

/// Manages the connection to physical (or simulated) hardware via a serial
/// transport. Emits events on `events()`; the caller is responsible for
/// forwarding them into a [`crate::bus::EventBus`] or the engine directly.
pub struct HardwareLink {
    factory: Arc<dyn SerialTransportFactory>,
    config: HardwareLinkConfig,
    state: Arc<Mutex<LinkState>>,
    user_initiated_disconnect: Arc<AtomicBool>,
    stop_flag: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    write_tx: Option<mpsc::UnboundedSender<String>>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    last_port: Option<String>,
}

impl HardwareLink {
    pub fn new(factory: Arc<dyn SerialTransportFactory>, config: HardwareLinkConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            factory,
            config,
            state: Arc::new(Mutex::new(LinkState::Disconnected)),
            user_initiated_disconnect: Arc::new(AtomicBool::new(false)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            worker: None,
            write_tx: None,
            events_tx,
            events_rx,
            last_port: None,
        }
    }

    pub fn list_available_ports(&self) -> Vec<String> {
        let mut ports = self.factory.list_ports();
        ports.sort();
        ports
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock().unwrap()
    }

    /// Drains one event, if any are queued, without blocking.
    pub fn try_recv_event(&mut self) -> Option<EngineEvent> {
        self.events_rx.try_recv().ok()
    }

    #[tracing::instrument(skip(self), fields(port))]
    pub fn connect(&mut self, port: impl Into<String>) {
        let port = port.into();
        if self.state() == LinkState::Connected || self.worker.is_some() {
            warn!("connection already active or in progress");
            return;
        }

        self.user_initiated_disconnect.store(false, Ordering::SeqCst);
        self.last_port = Some(port.clone());
        *self.state.lock().unwrap() = LinkState::Connecting;

        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<String>();
        self.write_tx = Some(write_tx);

        let factory = self.factory.clone();
        let state = self.state.clone();
        let stop_flag = Arc::new(AtomicBool::new(false));
        self.stop_flag = stop_flag.clone();
        let events_tx = self.events_tx.clone();
        let read_timeout = self.config.read_timeout;

        self.worker = Some(tokio::task::spawn_blocking(move || {
            info!(%port, "hardware worker starting");
            let mut transport = match factory.open(&port) {
                Ok(t) => t,
                Err(e) => {
                    warn!("failed to open port {port}: {e}");
                    *state.lock().unwrap() = LinkState::Disconnected;
                    let _ = events_tx.send(EngineEvent::LinkLost);
                    return;
                }
            };
            *state.lock().unwrap() = LinkState::Connected;

            while !stop_flag.load(Ordering::SeqCst) {
                while let Ok(cmd) = write_rx.try_recv() {
                    if let Err(e) = transport.write_line(&cmd) {
                        warn!("write error on {port}: {e}");
                    }
                }

                match transport.read_line(read_timeout) {
                    Ok(Some(line)) => {
                        debug!(%line, "hardware rx");
                        match parse_incoming_line(&line) {
                            Some(event) => {
                                let _ = events_tx.send(event);
                            }
                            None => {
                                let _ = events_tx.send(EngineEvent::HardwareRaw(line));
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("serial error on {port}: {e}. closing");
                        break;
                    }
                }
            }

            let was_connected = *state.lock().unwrap() == LinkState::Connected;
            let unexpected = was_connected && !stop_flag.load(Ordering::SeqCst);
            *state.lock().unwrap() = if unexpected { LinkState::Lost } else { LinkState::Disconnected };
            if unexpected {
                let _ = events_tx.send(EngineEvent::LinkLost);
            }
            info!(%port, "hardware worker finished");
        }));
    }

    pub fn disconnect(&mut self) {
        self.user_initiated_disconnect.store(true, Ordering::SeqCst);
        self.stop_flag.store(true, Ordering::SeqCst);
        self.write_tx = None;
    }

    /// Sends a command, appending a trailing newline if the caller omitted one.
    pub fn send_command(&self, name: &str, value: &str) -> bool {
        if self.state() != LinkState::Connected {
            warn!("attempted to send command '{name}' while disconnected");
            return false;
        }
        let mut line = format!("CMD:{name}:{value}");
        if !line.ends_with('\n') {
            line.push('\n');
        }
        match &self.write_tx {
            Some(tx) => tx.send(line).is_ok(),
            None => false,
        }
    }

    /// True if the link should attempt an unattended reconnect (i.e. it was
    /// lost, not deliberately disconnected by the caller).
    pub fn should_reconnect(&self) -> bool {
        self.state() != LinkState::Connected
            && !self.user_initiated_disconnect.load(Ordering::SeqCst)
            && self.last_port.is_some()
    }

    pub fn reconnect_interval(&self) -> Duration {
        self.config.reconnect_interval
    }

    pub fn last_port(&self) -> Option<&str> {
        self.last_port.as_deref()
    }
}
