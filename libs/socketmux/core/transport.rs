//! A single physical duplex socket
//!
//! # Architecture
//!
//! ```text
//!            send()                           ┌──────────────┐
//! caller ──> unbounded queue ──> send loop ──>│              │
//!                                             │  raw socket  │
//! observers <── dispatch <── assembler <──────│              │
//!                        receive loop         └──────────────┘
//! ```
//!
//! Every successful `connect()` opens a brand-new raw socket and binds
//! exactly one send loop and one receive loop to it. A failure in either
//! loop runs the close sequence, which is guarded by a single-transition
//! flag so the `Closed` event fires once per socket even when both loops
//! fail at the same moment. Each socket carries a generation number so a
//! loop left over from an earlier socket can never close a newer one.

use crate::config::SocketConfig;
use crate::connection_state::{AtomicMetrics, AtomicTransportState, TransportState};
use crate::observers::ObserverRegistry;
use crate::reassembly::{AssembledMessage, FrameAssembler};
use crate::traits::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Wait for the send loop to flush a graceful close
const GRACEFUL_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Events raised by a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Both loops are running
    Opened,
    /// A complete, decoded message
    Message(String),
    /// A loop failed; always followed by `Closed`
    Error(SocketError),
    /// The socket is gone, raised once per socket
    Closed { reason: String },
}

#[derive(Debug)]
enum TransportCommand {
    Send(WsMessage),
    Close,
}

struct LoopHandles {
    send: JoinHandle<()>,
    receive: JoinHandle<()>,
}

impl LoopHandles {
    fn abort(self) {
        self.send.abort();
        self.receive.abort();
    }
}

pub struct Transport {
    id: u64,
    url: String,
    config: Arc<SocketConfig>,
    connector: Arc<dyn SocketConnector>,
    byte_interpreter: Arc<dyn ByteInterpreter>,
    text_interpreter: Arc<dyn TextInterpreter>,
    state: AtomicTransportState,
    closing: AtomicBool,
    generation: AtomicU64,
    last_activity: Mutex<Option<Instant>>,
    send_tx: Mutex<Option<mpsc::UnboundedSender<TransportCommand>>>,
    loops: Mutex<Option<LoopHandles>>,
    closed: Notify,
    metrics: AtomicMetrics,
    observers: ObserverRegistry<TransportEvent>,
}

impl Transport {
    pub fn new(
        id: u64,
        url: impl Into<String>,
        config: Arc<SocketConfig>,
        connector: Arc<dyn SocketConnector>,
    ) -> Arc<Self> {
        Self::with_interpreters(
            id,
            url,
            config,
            connector,
            Arc::new(Utf8Bytes),
            Arc::new(IdentityText),
        )
    }

    pub fn with_interpreters(
        id: u64,
        url: impl Into<String>,
        config: Arc<SocketConfig>,
        connector: Arc<dyn SocketConnector>,
        byte_interpreter: Arc<dyn ByteInterpreter>,
        text_interpreter: Arc<dyn TextInterpreter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            url: url.into(),
            config,
            connector,
            byte_interpreter,
            text_interpreter,
            state: AtomicTransportState::new(TransportState::Closed),
            closing: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            last_activity: Mutex::new(None),
            send_tx: Mutex::new(None),
            loops: Mutex::new(None),
            closed: Notify::new(),
            metrics: AtomicMetrics::new(),
            observers: ObserverRegistry::new(),
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    #[inline]
    pub fn state(&self) -> TransportState {
        self.state.get()
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.state.is_open() && !self.closing.load(Ordering::Acquire)
    }

    pub fn last_activity(&self) -> Option<Instant> {
        *self.last_activity.lock()
    }

    pub fn metrics(&self) -> &AtomicMetrics {
        &self.metrics
    }

    pub fn observers(&self) -> &ObserverRegistry<TransportEvent> {
        &self.observers
    }

    /// Open a new raw socket and start both loops.
    ///
    /// Does not report success until both loops have observably started.
    /// If they have not within `startup_timeout`, the attempt fails and the
    /// socket output is closed.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        if self.closing.load(Ordering::Acquire) {
            return Err(SocketError::InvalidState(
                "transport is closing; reset it before connecting".into(),
            ));
        }

        debug!("[socket {}] connecting to {}", self.id, self.url);

        let (sink, source) =
            match timeout(self.config.connect_timeout, self.connector.connect(&self.url)).await {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    warn!("[socket {}] connect failed: {}", self.id, e);
                    return Err(e);
                }
                Err(_) => {
                    warn!("[socket {}] connect timed out", self.id);
                    return Err(SocketError::ConnectFailed(format!(
                        "no answer from {} within {:?}",
                        self.url, self.config.connect_timeout
                    )));
                }
            };

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let (send_ready_tx, send_ready_rx) = oneshot::channel();
        let (receive_ready_tx, receive_ready_rx) = oneshot::channel();

        *self.send_tx.lock() = Some(tx);
        let handles = LoopHandles {
            send: tokio::spawn(Arc::clone(self).send_loop(generation, sink, rx, send_ready_tx)),
            receive: tokio::spawn(Arc::clone(self).receive_loop(
                generation,
                source,
                receive_ready_tx,
            )),
        };
        *self.loops.lock() = Some(handles);

        let started = timeout(self.config.startup_timeout, async {
            send_ready_rx.await.is_ok() && receive_ready_rx.await.is_ok()
        })
        .await;

        match started {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                error!(
                    "[socket {}] loops did not start within {:?}, closing output",
                    self.id, self.config.startup_timeout
                );
                self.abort_loops();
                return Err(SocketError::StartupTimeout(self.config.startup_timeout));
            }
        }

        if self.closing.load(Ordering::Acquire) {
            self.abort_loops();
            return Err(SocketError::ConnectionClosed(
                "socket closed during startup".into(),
            ));
        }

        self.state.set(TransportState::Open);
        self.touch();
        info!("[socket {}] connected to {}", self.id, self.url);
        self.observers.emit(&TransportEvent::Opened);
        Ok(())
    }

    /// Queue a message; writes happen in FIFO order on the send loop
    pub fn send(&self, message: WsMessage) -> Result<()> {
        if self.closing.load(Ordering::Acquire) {
            return Err(SocketError::ConnectionClosed("transport is closing".into()));
        }
        match self.send_tx.lock().as_ref() {
            Some(tx) => tx
                .send(TransportCommand::Send(message))
                .map_err(|e| SocketError::ChannelSend(e.to_string())),
            None => Err(SocketError::ConnectionClosed("transport is not open".into())),
        }
    }

    /// Close gracefully: flush queued messages, close the socket output,
    /// then run the close sequence
    pub async fn close(&self) {
        let tx = self.send_tx.lock().clone();
        let Some(tx) = tx else {
            return;
        };

        let notified = self.closed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if tx.send(TransportCommand::Close).is_err() {
            return;
        }

        if timeout(GRACEFUL_CLOSE_TIMEOUT, notified).await.is_err() {
            warn!("[socket {}] graceful close timed out, forcing", self.id);
            let generation = self.generation.load(Ordering::Acquire);
            self.close_internal(generation, "closed by client".into(), None);
        }
    }

    /// Discard queued output and prepare for a fresh socket.
    ///
    /// Identity is kept; the next `connect()` opens a new raw socket.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.send_tx.lock().take();
        self.abort_loops();
        self.state.set(TransportState::Closed);
        self.closing.store(false, Ordering::Release);
        debug!("[socket {}] reset", self.id);
    }

    fn touch(&self) {
        *self.last_activity.lock() = Some(Instant::now());
    }

    fn abort_loops(&self) {
        self.send_tx.lock().take();
        if let Some(handles) = self.loops.lock().take() {
            handles.abort();
        }
    }

    fn close_internal(&self, generation: u64, reason: String, error: Option<SocketError>) {
        if generation != self.generation.load(Ordering::Acquire) {
            debug!("[socket {}] ignoring close from stale socket", self.id);
            return;
        }
        if self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.state.set(TransportState::Closing);
        self.abort_loops();
        self.state.set(TransportState::Closed);

        info!("[socket {}] closed: {}", self.id, reason);
        if let Some(e) = error {
            self.observers.emit(&TransportEvent::Error(e));
        }
        self.observers.emit(&TransportEvent::Closed { reason });
        self.closed.notify_waiters();
    }

    async fn send_loop(
        self: Arc<Self>,
        generation: u64,
        mut sink: Box<dyn FrameSink>,
        mut rx: mpsc::UnboundedReceiver<TransportCommand>,
        ready: oneshot::Sender<()>,
    ) {
        let _ = ready.send(());
        debug!("[socket {}] send loop started", self.id);

        while let Some(command) = rx.recv().await {
            match command {
                TransportCommand::Send(message) => {
                    let bytes = message.len();
                    if let Err(e) = sink.send(message).await {
                        error!("[socket {}] send failed: {}", self.id, e);
                        self.close_internal(generation, format!("send failed: {}", e), Some(e));
                        return;
                    }
                    self.metrics.record_send(bytes);
                }
                TransportCommand::Close => {
                    if let Err(e) = sink.close().await {
                        debug!("[socket {}] error closing output: {}", self.id, e);
                    }
                    self.close_internal(generation, "closed by client".into(), None);
                    return;
                }
            }
        }

        // Queue dropped by reset or close
        let _ = sink.close().await;
        debug!("[socket {}] send loop exiting", self.id);
    }

    async fn receive_loop(
        self: Arc<Self>,
        generation: u64,
        mut source: Box<dyn FrameSource>,
        ready: oneshot::Sender<()>,
    ) {
        let _ = ready.send(());
        debug!("[socket {}] receive loop started", self.id);
        let mut assembler = FrameAssembler::new();

        loop {
            let next = match self.config.no_data_timeout {
                Some(limit) => match timeout(limit, source.next_frame()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!("[socket {}] no data received for {:?}", self.id, limit);
                        self.close_internal(
                            generation,
                            format!("no data received for {:?}", limit),
                            None,
                        );
                        return;
                    }
                },
                None => source.next_frame().await,
            };

            match next {
                Some(Ok(frame)) => {
                    self.touch();
                    match frame {
                        Frame::Ping(_) | Frame::Pong(_) => {}
                        Frame::Close(reason) => {
                            let reason = reason.unwrap_or_else(|| "closed by server".into());
                            self.close_internal(generation, reason, None);
                            return;
                        }
                        data => match assembler.push(data) {
                            Ok(Some(message)) => self.dispatch(message),
                            Ok(None) => {}
                            Err(e) => warn!("[socket {}] dropping frames: {}", self.id, e),
                        },
                    }
                }
                Some(Err(e)) => {
                    error!("[socket {}] receive failed: {}", self.id, e);
                    self.close_internal(generation, format!("receive failed: {}", e), Some(e));
                    return;
                }
                None => {
                    self.close_internal(generation, "stream ended".into(), None);
                    return;
                }
            }
        }
    }

    fn dispatch(&self, message: AssembledMessage) {
        self.metrics.increment_received();

        let decoded = match message {
            AssembledMessage::Binary(data) => self.byte_interpreter.interpret(&data),
            AssembledMessage::Text(data) => String::from_utf8(data)
                .map_err(|e| SocketError::Protocol(format!("text message is not UTF-8: {}", e)))
                .and_then(|text| self.text_interpreter.interpret(text)),
        };

        match decoded {
            Ok(text) => self.observers.emit(&TransportEvent::Message(text)),
            Err(e) => warn!("[socket {}] dropping message: {}", self.id, e),
        }
    }
}
