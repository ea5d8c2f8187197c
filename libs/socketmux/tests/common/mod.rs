//! Common test utilities for socketmux integration tests
//!
//! Two kinds of sockets:
//! - [`ScriptedConnector`]: in-memory sockets whose inbound frames, failures
//!   and auto-replies the test controls
//! - [`MockWsServer`]: a real `tokio-tungstenite` server on `127.0.0.1:0`

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use socketmux::*;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

/// Macro for verbose test output (controlled by TEST_VERBOSE env var)
#[macro_export]
macro_rules! verbose_println {
    ($($arg:tt)*) => {
        if std::env::var("TEST_VERBOSE").is_ok() {
            println!($($arg)*);
        }
    };
}

/// Produces the server's reply to a written message, if any
pub type Responder = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

type Inbound = mpsc::UnboundedSender<Option<Result<Frame>>>;

/// Acknowledge every message carrying an `id`; reject params containing "bad"
pub fn jsonrpc_responder() -> Responder {
    Arc::new(|message: &Value| {
        let id = message.get("id")?.clone();
        let rejected = message["params"]
            .as_array()
            .map_or(false, |p| p.iter().any(|v| v.as_str().map_or(false, |s| s.contains("bad"))));
        if rejected {
            Some(json!({"id": id, "error": {"code": -1, "msg": "invalid stream"}}))
        } else {
            Some(json!({"id": id, "result": null}))
        }
    })
}

/// Server side of one scripted socket
#[derive(Clone)]
pub struct ScriptedSocket {
    writes: Arc<Mutex<Vec<WsMessage>>>,
    inbound: Inbound,
}

impl ScriptedSocket {
    pub fn push(&self, frame: Frame) {
        let _ = self.inbound.send(Some(Ok(frame)));
    }

    pub fn push_text(&self, text: &str) {
        self.push(Frame::text(text));
    }

    /// End the stream as if the peer went away
    pub fn disconnect(&self) {
        let _ = self.inbound.send(None);
    }

    /// Fail the next read
    pub fn fail(&self, reason: &str) {
        let _ = self
            .inbound
            .send(Some(Err(SocketError::WebSocket(reason.to_string()))));
    }

    pub fn writes(&self) -> Vec<WsMessage> {
        self.writes.lock().clone()
    }

    pub fn written_json(&self) -> Vec<Value> {
        self.writes
            .lock()
            .iter()
            .filter_map(|m| m.as_text())
            .filter_map(|t| serde_json::from_str(t).ok())
            .collect()
    }
}

struct ScriptedSink {
    writes: Arc<Mutex<Vec<WsMessage>>>,
    inbound: Inbound,
    responder: Option<Responder>,
}

#[async_trait]
impl FrameSink for ScriptedSink {
    async fn send(&mut self, message: WsMessage) -> Result<()> {
        let reply = match (&self.responder, message.as_text()) {
            (Some(responder), Some(text)) => serde_json::from_str::<Value>(text)
                .ok()
                .and_then(|value| responder(&value)),
            _ => None,
        };
        self.writes.lock().push(message);
        if let Some(reply) = reply {
            let _ = self.inbound.send(Some(Ok(Frame::text(reply.to_string()))));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct ScriptedSource(mpsc::UnboundedReceiver<Option<Result<Frame>>>);

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        self.0.recv().await.flatten()
    }
}

/// In-memory connector recording every socket it opens
pub struct ScriptedConnector {
    sockets: Mutex<Vec<ScriptedSocket>>,
    responder: Option<Responder>,
    refuse: AtomicBool,
    attempts: AtomicU32,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    pub fn with_responder(responder: Responder) -> Arc<Self> {
        Arc::new(Self::build(Some(responder)))
    }

    fn build(responder: Option<Responder>) -> Self {
        Self {
            sockets: Mutex::new(Vec::new()),
            responder,
            refuse: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
        }
    }

    /// Make every following connect attempt fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Connect attempts, successful or not
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.lock().len()
    }

    pub fn socket(&self, index: usize) -> Option<ScriptedSocket> {
        self.sockets.lock().get(index).cloned()
    }

    pub fn latest(&self) -> Option<ScriptedSocket> {
        self.sockets.lock().last().cloned()
    }
}

#[async_trait]
impl SocketConnector for ScriptedConnector {
    async fn connect(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SocketError::ConnectFailed(format!("{} refused", url)));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let writes = Arc::new(Mutex::new(Vec::new()));
        self.sockets.lock().push(ScriptedSocket {
            writes: Arc::clone(&writes),
            inbound: tx.clone(),
        });

        Ok((
            Box::new(ScriptedSink {
                writes,
                inbound: tx,
                responder: self.responder.clone(),
            }),
            Box::new(ScriptedSource(rx)),
        ))
    }
}

/// Split `data` at `cuts` into a fragmented frame sequence
pub fn fragment(data: &[u8], text: bool, cuts: &[usize]) -> Vec<Frame> {
    let mut bounds: Vec<usize> = cuts
        .iter()
        .copied()
        .filter(|c| *c > 0 && *c < data.len())
        .collect();
    bounds.sort_unstable();
    bounds.dedup();
    bounds.push(data.len());

    let mut frames = Vec::with_capacity(bounds.len());
    let mut start = 0;
    for (i, end) in bounds.iter().enumerate() {
        let payload = data[start..*end].to_vec();
        let fin = i + 1 == bounds.len();
        let frame = match (i, text) {
            (0, true) => Frame::Text { payload, fin },
            (0, false) => Frame::Binary { payload, fin },
            _ => Frame::Continuation { payload, fin },
        };
        frames.push(frame);
        start = *end;
    }
    frames
}

/// Poll `condition` until it holds or `limit` passes
pub async fn wait_until<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// An address nothing listens on
pub async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{}", addr)
}

/// Await `future` with a test-friendly bound
pub async fn within<T>(limit: Duration, future: impl Future<Output = T>) -> T {
    match tokio::time::timeout(limit, future).await {
        Ok(value) => value,
        Err(_) => panic!("operation did not finish within {:?}", limit),
    }
}

/// A mock JSON-RPC WebSocket server.
///
/// Acknowledges every request carrying an `id`. After acknowledging a
/// `SUBSCRIBE`, it pushes one `{"stream": <param>, "data": "hello"}` message
/// per param.
pub struct MockWsServer {
    pub addr: SocketAddr,
    shutdown: Arc<Notify>,
    kick: Arc<Notify>,
    accept_task: JoinHandle<()>,
}

impl MockWsServer {
    /// Create and start a new mock WebSocket server
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(Notify::new());
        let kick = Arc::new(Notify::new());
        let shutdown_clone = shutdown.clone();
        let kick_clone = kick.clone();

        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _)) => {
                                let shutdown = shutdown_clone.clone();
                                let kick = kick_clone.clone();
                                tokio::spawn(async move {
                                    Self::handle_connection(stream, shutdown, kick).await;
                                });
                            }
                            Err(e) => {
                                eprintln!("Accept error: {}", e);
                                break;
                            }
                        }
                    }
                    _ = shutdown_clone.notified() => {
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            shutdown,
            kick,
            accept_task,
        }
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        shutdown: Arc<Notify>,
        kick: Arc<Notify>,
    ) {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::accept_async;
        use tokio_tungstenite::tungstenite::Message;

        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                eprintln!("WebSocket handshake failed: {}", e);
                return;
            }
        };

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let Ok(request) = serde_json::from_str::<Value>(&text) else {
                                continue;
                            };
                            let Some(id) = request.get("id").cloned() else {
                                continue;
                            };

                            let ack = json!({"id": id, "result": null});
                            if write.send(Message::Text(ack.to_string())).await.is_err() {
                                break;
                            }

                            if request["method"] == "SUBSCRIBE" {
                                for stream in request["params"].as_array().cloned().unwrap_or_default() {
                                    let data = json!({"stream": stream, "data": "hello"});
                                    if write.send(Message::Text(data.to_string())).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if write.send(Message::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    }
                }
                _ = kick.notified() => {
                    break;
                }
                _ = shutdown.notified() => {
                    break;
                }
            }
        }
    }

    /// Get the WebSocket URL for this server
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Drop every open client socket; the listener keeps accepting
    pub fn kick_all(&self) {
        self.kick.notify_waiters();
    }

    /// Shutdown the server
    ///
    /// Aborting the accept task drops the listener even if the task has
    /// not been polled yet.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        self.shutdown.notify_waiters();
    }
}

impl Drop for MockWsServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
