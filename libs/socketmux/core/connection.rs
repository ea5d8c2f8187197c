//! Logical session over one transport
//!
//! # State machine
//!
//! ```text
//! Disconnected ──connect()──> Connecting ──ok──> Open
//!                                  │               │ unexpected close
//!                                  │ err           ▼
//!                                  └──> Disconnected   Reconnecting ──restored──> Open
//!                                                      │
//!                                   exhausted / close()▼
//!                                                    Closed (terminal)
//! ```
//!
//! A connection owns the subscriptions routed over its transport and the
//! pending requests awaiting answers on it. Every inbound message is offered
//! to the pending tracker first and only then to the subscriptions, so the
//! answer to a query does not also show up as stream data.
//!
//! At most one reconnect loop runs per connection. It is spawned behind a
//! compare-and-set guard and its handle is kept so `close()` can abort and
//! join it.

use crate::config::SocketConfig;
use crate::connection_state::{AtomicConnectionState, ConnectionState};
use crate::ids::IdGenerator;
use crate::observers::{ObserverId, ObserverRegistry};
use crate::pending::{MessageMatcher, PendingRequestTracker};
use crate::subscription::{DataCallback, DataEvent, Subscription, SubscriptionStatus};
use crate::transport::{Transport, TransportEvent};
use crate::traits::*;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Events raised by a connection
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Initial connect succeeded
    Opened,
    /// Transport dropped unexpectedly; a reconnect loop is running
    Lost { reason: String },
    /// Reconnected and every confirmed subscription was restored
    Restored { outage: Duration },
    /// Terminal; raised exactly once
    Closed { reason: String },
    /// Message matched neither a pending request nor a subscription
    Unhandled(String),
    SubscriptionStatus {
        subscription_id: u64,
        status: SubscriptionStatus,
    },
}

/// Point-in-time view of a connection
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub id: u64,
    pub url: String,
    pub state: ConnectionState,
    pub authenticated: bool,
    pub user_subscriptions: usize,
    pub pending_requests: usize,
    pub reconnect_attempts: u32,
    pub resubscribe_attempts: u32,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub reconnect_count: u64,
    pub last_activity: Option<Instant>,
}

pub struct Connection {
    transport: Arc<Transport>,
    config: Arc<SocketConfig>,
    protocol: Arc<dyn SocketProtocol>,
    ids: Arc<IdGenerator>,
    state: AtomicConnectionState,
    subscriptions: Mutex<Vec<Arc<Subscription>>>,
    pending: PendingRequestTracker,
    should_reconnect: AtomicBool,
    reconnecting: AtomicBool,
    reconnect_loops: AtomicU64,
    reconnect_attempts: AtomicU32,
    resubscribe_attempts: AtomicU32,
    disconnected_at: Mutex<Option<Instant>>,
    /// Carries authenticated streams; survives reconnects
    authenticated: AtomicBool,
    /// Authentication done on the current socket
    session_authenticated: AtomicBool,
    closed_fired: AtomicBool,
    connect_lock: tokio::sync::Mutex<()>,
    auth_lock: tokio::sync::Mutex<()>,
    receive_gate: Mutex<()>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    transport_observer: Mutex<Option<ObserverId>>,
    events: ObserverRegistry<ConnectionEvent>,
}

impl Connection {
    pub fn new(
        transport: Arc<Transport>,
        config: Arc<SocketConfig>,
        protocol: Arc<dyn SocketProtocol>,
        ids: Arc<IdGenerator>,
    ) -> Arc<Self> {
        let connection = Arc::new(Self {
            transport,
            config,
            protocol,
            ids,
            state: AtomicConnectionState::new(ConnectionState::Disconnected),
            subscriptions: Mutex::new(Vec::new()),
            pending: PendingRequestTracker::new(),
            should_reconnect: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            reconnect_loops: AtomicU64::new(0),
            reconnect_attempts: AtomicU32::new(0),
            resubscribe_attempts: AtomicU32::new(0),
            disconnected_at: Mutex::new(None),
            authenticated: AtomicBool::new(false),
            session_authenticated: AtomicBool::new(false),
            closed_fired: AtomicBool::new(false),
            connect_lock: tokio::sync::Mutex::new(()),
            auth_lock: tokio::sync::Mutex::new(()),
            receive_gate: Mutex::new(()),
            reconnect_task: Mutex::new(None),
            transport_observer: Mutex::new(None),
            events: ObserverRegistry::new(),
        });

        let weak = Arc::downgrade(&connection);
        let observer = connection.transport.observers().add(move |event| {
            if let Some(connection) = weak.upgrade() {
                connection.on_transport_event(event);
            }
        });
        *connection.transport_observer.lock() = Some(observer);

        connection
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.transport.id()
    }

    pub fn url(&self) -> &str {
        self.transport.url()
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_open(&self) -> bool {
        self.state.is_open() && self.transport.is_open()
    }

    /// Can take new subscriptions (not closing, not in the middle of recovery)
    pub fn is_usable(&self) -> bool {
        matches!(
            self.state.get(),
            ConnectionState::Disconnected | ConnectionState::Connecting | ConnectionState::Open
        )
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::Acquire)
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn events(&self) -> &ObserverRegistry<ConnectionEvent> {
        &self.events
    }

    pub fn pending(&self) -> &PendingRequestTracker {
        &self.pending
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Acquire)
    }

    pub fn resubscribe_attempts(&self) -> u32 {
        self.resubscribe_attempts.load(Ordering::Acquire)
    }

    /// Total reconnect loops ever started
    pub fn reconnect_loops_started(&self) -> u64 {
        self.reconnect_loops.load(Ordering::Acquire)
    }

    pub fn user_subscription_count(&self) -> usize {
        self.subscriptions.lock().iter().filter(|s| s.is_user()).count()
    }

    pub fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions.lock().clone()
    }

    pub fn has_subscription(&self, id: u64) -> bool {
        self.subscriptions.lock().iter().any(|s| s.id() == id)
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let metrics = self.transport.metrics();
        ConnectionSnapshot {
            id: self.id(),
            url: self.url().to_string(),
            state: self.state(),
            authenticated: self.is_authenticated(),
            user_subscriptions: self.user_subscription_count(),
            pending_requests: self.pending.len(),
            reconnect_attempts: self.reconnect_attempts(),
            resubscribe_attempts: self.resubscribe_attempts(),
            messages_sent: metrics.messages_sent(),
            messages_received: metrics.messages_received(),
            reconnect_count: metrics.reconnect_count(),
            last_activity: self.transport.last_activity(),
        }
    }

    /// Open the transport; a no-op when already open
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let _guard = self.connect_lock.lock().await;

        match self.state.get() {
            ConnectionState::Open if self.transport.is_open() => return Ok(()),
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(SocketError::InvalidState(format!(
                    "connection {} is closed",
                    self.id()
                )))
            }
            ConnectionState::Reconnecting => {
                return Err(SocketError::InvalidState(format!(
                    "connection {} is reconnecting",
                    self.id()
                )))
            }
            _ => {}
        }

        self.state.set(ConnectionState::Connecting);
        if let Err(e) = self.transport.connect().await {
            self.transport.reset();
            let _ = self
                .state
                .compare_exchange(ConnectionState::Connecting, ConnectionState::Disconnected);
            return Err(e);
        }

        if self
            .state
            .compare_exchange(ConnectionState::Connecting, ConnectionState::Open)
            .is_err()
        {
            // close() ran while connecting
            return Err(SocketError::ConnectionClosed(format!(
                "connection {} closed while connecting",
                self.id()
            )));
        }

        self.should_reconnect.store(true, Ordering::Release);
        info!("[connection {}] open", self.id());
        self.events.emit(&ConnectionEvent::Opened);

        // The socket may have died before the state became Open
        if !self.transport.is_open() {
            self.handle_transport_closed("closed during connect".into());
        }
        Ok(())
    }

    /// Fire-and-forget send
    pub fn send(&self, message: impl Into<WsMessage>) -> Result<()> {
        if self.state.is_terminating() {
            return Err(SocketError::ConnectionClosed(format!(
                "connection {} is closed",
                self.id()
            )));
        }
        self.transport.send(message.into())
    }

    /// Send `payload` and wait for the first inbound message `matcher` accepts
    pub async fn send_and_wait(
        &self,
        payload: &Value,
        timeout: Duration,
        matcher: MessageMatcher,
    ) -> Result<Value> {
        let ticket = self.pending.register(matcher, timeout);
        if let Err(e) = self.send(payload) {
            self.pending.remove(ticket.id());
            return Err(e);
        }
        self.pending.wait(ticket).await
    }

    /// Authenticate the current socket once; later calls are no-ops
    pub async fn authenticate(&self) -> Result<()> {
        let _guard = self.auth_lock.lock().await;
        if self.session_authenticated.load(Ordering::Acquire) {
            return Ok(());
        }
        if !self.protocol.has_credentials() {
            return Err(SocketError::MissingCredentials);
        }

        self.send_authentication().await?;
        self.authenticated.store(true, Ordering::Release);
        self.session_authenticated.store(true, Ordering::Release);
        info!("[connection {}] authenticated", self.id());
        Ok(())
    }

    /// Attach a subscription without any network traffic
    pub fn add_subscription(&self, subscription: Arc<Subscription>) {
        if subscription.is_authenticated() {
            self.authenticated.store(true, Ordering::Release);
        }
        self.subscriptions.lock().push(subscription);
    }

    pub fn remove_subscription(&self, id: u64) -> Option<Arc<Subscription>> {
        let mut subscriptions = self.subscriptions.lock();
        let index = subscriptions.iter().position(|s| s.id() == id)?;
        Some(subscriptions.remove(index))
    }

    /// Register a housekeeping handler that is not a user subscription
    pub fn add_handler<F>(&self, filter: Option<MessageMatcher>, handler: F) -> u64
    where
        F: Fn(&DataEvent<'_>) + Send + Sync + 'static,
    {
        let id = self.ids.next_subscription_id();
        let callback: DataCallback = Arc::new(handler);
        self.subscriptions
            .lock()
            .push(Arc::new(Subscription::internal(id, filter, callback)));
        id
    }

    /// Run the subscribe handshake for an attached subscription.
    ///
    /// Authenticates first when the subscription needs it. Identifier-only
    /// subscriptions are confirmed immediately.
    pub async fn subscribe(&self, subscription: &Subscription) -> Result<()> {
        if subscription.is_authenticated() {
            self.authenticate().await?;
        }

        match self.confirm(subscription).await {
            Ok(()) => {
                debug!(
                    "[connection {}] subscription {} confirmed",
                    self.id(),
                    subscription.id()
                );
                self.emit_status(subscription.id(), SubscriptionStatus::Confirmed);
                Ok(())
            }
            Err(e) => {
                warn!(
                    "[connection {}] subscription {} failed: {}",
                    self.id(),
                    subscription.id(),
                    e
                );
                self.emit_status(subscription.id(), SubscriptionStatus::Rejected);
                Err(e)
            }
        }
    }

    /// Remove a subscription.
    ///
    /// Removing the last user subscription closes the connection instead of
    /// sending an unsubscribe request. Otherwise a confirmed request-based
    /// subscription is undone on the wire and its acknowledgment awaited.
    /// The subscription is gone locally whatever the outcome.
    pub async fn unsubscribe(self: &Arc<Self>, subscription_id: u64) -> Result<()> {
        let subscription = self.remove_subscription(subscription_id).ok_or_else(|| {
            SocketError::InvalidState(format!("subscription {} not found", subscription_id))
        })?;

        if subscription.is_user() {
            self.emit_status(subscription_id, SubscriptionStatus::Unsubscribed);
        }

        if subscription.is_user() && self.user_subscription_count() == 0 {
            self.close("last subscription removed").await;
            return Ok(());
        }

        let Some(request) = subscription.request().filter(|_| subscription.is_confirmed()) else {
            return Ok(());
        };
        let Some(unsubscribe) = self.protocol.unsubscribe_request(request) else {
            return Ok(());
        };
        if !self.is_open() {
            return Ok(());
        }

        let protocol = Arc::clone(&self.protocol);
        let expected = unsubscribe.clone();
        let matcher: MessageMatcher = Arc::new(move |message: &Value| {
            protocol.unsubscribe_response(&expected, message).is_some()
        });

        let answer = self
            .send_and_wait(&unsubscribe, self.config.response_timeout, matcher)
            .await?;
        match self.protocol.unsubscribe_response(&unsubscribe, &answer) {
            Some(true) => Ok(()),
            _ => Err(SocketError::SubscriptionRejected(format!(
                "unsubscribe refused: {}",
                answer
            ))),
        }
    }

    /// Intentional close: no reconnect, pending requests fail, `Closed` fires once
    pub async fn close(self: &Arc<Self>, reason: impl Into<String>) {
        if self.begin_close() {
            self.complete_close(reason.into()).await;
        }
    }

    /// Move to `Closing` so the pool stops selecting this connection.
    ///
    /// Returns false if a close is already under way. The caller that gets
    /// true must follow up with [`complete_close`](Self::complete_close).
    pub(crate) fn begin_close(&self) -> bool {
        self.should_reconnect.store(false, Ordering::Release);

        loop {
            let current = self.state.get();
            if matches!(current, ConnectionState::Closing | ConnectionState::Closed) {
                return false;
            }
            if self
                .state
                .compare_exchange(current, ConnectionState::Closing)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub(crate) async fn complete_close(self: &Arc<Self>, reason: String) {
        info!("[connection {}] closing: {}", self.id(), reason);

        let task = self.reconnect_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        self.pending.fail_all(&reason);
        self.transport.close().await;
        self.transport.reset();
        self.finish(reason);
    }

    /// Drop the current socket and go through the reconnect path
    pub async fn reconnect(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(ConnectionState::Open, ConnectionState::Reconnecting)
            .is_err()
        {
            debug!(
                "[connection {}] reconnect ignored in state {:?}",
                self.id(),
                self.state()
            );
            return;
        }

        self.should_reconnect.store(true, Ordering::Release);
        self.mark_lost("reconnect requested".into());
        self.transport.close().await;
        self.spawn_reconnect();
    }

    fn on_transport_event(self: &Arc<Self>, event: &TransportEvent) {
        match event {
            TransportEvent::Opened => {}
            TransportEvent::Message(raw) => self.route(raw),
            TransportEvent::Error(e) => warn!("[connection {}] transport error: {}", self.id(), e),
            TransportEvent::Closed { reason } => self.handle_transport_closed(reason.clone()),
        }
    }

    fn route(&self, raw: &str) {
        let _gate = self.receive_gate.lock();

        let data: Value = match serde_json::from_str(raw) {
            Ok(data) => data,
            Err(e) => {
                warn!("[connection {}] dropping malformed message: {}", self.id(), e);
                return;
            }
        };

        let answered = self.pending.offer(&data);
        if answered && !self.config.deliver_answered_to_subscriptions {
            return;
        }

        let subscriptions = self.subscriptions.lock().clone();
        let mut delivered = false;
        for subscription in subscriptions.iter().filter(|s| s.accepts(&data)) {
            subscription.deliver(&DataEvent {
                connection_id: self.id(),
                subscription_id: subscription.id(),
                data: &data,
                raw,
            });
            delivered = true;
        }

        if !delivered && !answered {
            self.events.emit(&ConnectionEvent::Unhandled(raw.to_string()));
        }
    }

    fn handle_transport_closed(self: &Arc<Self>, reason: String) {
        self.pending.fail_all(&reason);
        self.session_authenticated.store(false, Ordering::Release);

        match self.state.get() {
            ConnectionState::Open => {
                if !self.config.auto_reconnect || !self.should_reconnect.load(Ordering::Acquire) {
                    self.finish(reason);
                    return;
                }
                if self
                    .state
                    .compare_exchange(ConnectionState::Open, ConnectionState::Reconnecting)
                    .is_err()
                {
                    return;
                }
                self.mark_lost(reason);
            }
            ConnectionState::Reconnecting => {}
            _ => return,
        }

        self.spawn_reconnect();
    }

    fn mark_lost(&self, reason: String) {
        self.session_authenticated.store(false, Ordering::Release);
        self.disconnected_at.lock().get_or_insert_with(Instant::now);
        warn!("[connection {}] lost: {}", self.id(), reason);
        self.events.emit(&ConnectionEvent::Lost { reason });
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("[connection {}] reconnect loop already running", self.id());
            return;
        }

        self.reconnect_loops.fetch_add(1, Ordering::AcqRel);
        let task = tokio::spawn(Arc::clone(self).reconnect_loop());
        *self.reconnect_task.lock() = Some(task);
    }

    async fn reconnect_loop(self: Arc<Self>) {
        info!(
            "[connection {}] reconnecting every {:?}",
            self.id(),
            self.config.reconnect_interval
        );

        loop {
            tokio::time::sleep(self.config.reconnect_interval).await;
            if !self.should_reconnect.load(Ordering::Acquire) {
                debug!("[connection {}] reconnect cancelled", self.id());
                break;
            }

            self.transport.reset();
            if let Err(e) = self.transport.connect().await {
                let attempts = self.reconnect_attempts.fetch_add(1, Ordering::AcqRel) + 1;
                warn!(
                    "[connection {}] reconnect attempt {} failed: {}",
                    self.id(),
                    attempts,
                    e
                );
                if exhausted(attempts, self.config.max_reconnect_tries) {
                    self.give_up(attempts, e.to_string());
                    return;
                }
                continue;
            }

            if !self.should_reconnect.load(Ordering::Acquire) {
                break;
            }

            match self.restore().await {
                Ok(()) => {
                    self.reconnect_attempts.store(0, Ordering::Release);
                    self.resubscribe_attempts.store(0, Ordering::Release);
                    self.transport.metrics().increment_reconnects();

                    let outage = self
                        .disconnected_at
                        .lock()
                        .take()
                        .map(|at| at.elapsed())
                        .unwrap_or_default();

                    if self
                        .state
                        .compare_exchange(ConnectionState::Reconnecting, ConnectionState::Open)
                        .is_ok()
                    {
                        info!("[connection {}] restored after {:?}", self.id(), outage);
                        self.events.emit(&ConnectionEvent::Restored { outage });
                    }
                    break;
                }
                Err(e) => {
                    let attempts = self.resubscribe_attempts.fetch_add(1, Ordering::AcqRel) + 1;
                    warn!(
                        "[connection {}] resubscribe attempt {} failed: {}",
                        self.id(),
                        attempts,
                        e
                    );
                    if exhausted(attempts, self.config.max_resubscribe_tries) {
                        self.give_up(attempts, e.to_string());
                        return;
                    }
                }
            }
        }

        self.reconnecting.store(false, Ordering::Release);

        // A close that landed between the last transition and the guard release
        if self.should_reconnect.load(Ordering::Acquire) && !self.transport.is_open() {
            self.handle_transport_closed("closed during recovery".into());
        }
    }

    /// Re-authenticate and resend every confirmed request-based subscription
    async fn restore(&self) -> Result<()> {
        if self.is_authenticated() {
            let _guard = self.auth_lock.lock().await;
            self.send_authentication().await?;
            self.session_authenticated.store(true, Ordering::Release);
        }

        let targets: Vec<Arc<Subscription>> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|s| s.needs_resubscribe())
            .cloned()
            .collect();

        debug!(
            "[connection {}] resubscribing {} subscriptions",
            self.id(),
            targets.len()
        );

        for batch in targets.chunks(self.config.max_concurrent_resubscriptions.max(1)) {
            let results = join_all(batch.iter().map(|s| self.confirm(s))).await;
            if let Some(e) = results.into_iter().find_map(|r| r.err()) {
                return Err(e);
            }
            if !self.transport.is_open() {
                return Err(SocketError::ConnectionClosed(
                    "transport closed during resubscription".into(),
                ));
            }
        }
        Ok(())
    }

    async fn confirm(&self, subscription: &Subscription) -> Result<()> {
        let Some(request) = subscription.request() else {
            subscription.set_confirmed(true);
            return Ok(());
        };

        let protocol = Arc::clone(&self.protocol);
        let expected = request.clone();
        let matcher: MessageMatcher = Arc::new(move |message: &Value| {
            protocol.subscribe_response(&expected, message).is_some()
        });

        let answer = self
            .send_and_wait(request, self.config.response_timeout, matcher)
            .await?;
        match self.protocol.subscribe_response(request, &answer) {
            Some(true) => {
                subscription.set_confirmed(true);
                Ok(())
            }
            _ => Err(SocketError::SubscriptionRejected(answer.to_string())),
        }
    }

    async fn send_authentication(&self) -> Result<()> {
        let Some(request) = self.protocol.authentication_request().await? else {
            return Ok(());
        };

        let protocol = Arc::clone(&self.protocol);
        let expected = request.clone();
        let matcher: MessageMatcher = Arc::new(move |message: &Value| {
            protocol.authentication_response(&expected, message).is_some()
        });

        let answer = self
            .send_and_wait(&request, self.config.response_timeout, matcher)
            .await?;
        match self.protocol.authentication_response(&request, &answer) {
            Some(true) => Ok(()),
            _ => Err(SocketError::AuthenticationFailed(answer.to_string())),
        }
    }

    fn give_up(&self, attempts: u32, reason: String) {
        let error = SocketError::ReconnectionFailed { attempts, reason };
        error!("[connection {}] {}", self.id(), error);
        self.should_reconnect.store(false, Ordering::Release);
        self.reconnecting.store(false, Ordering::Release);
        self.transport.reset();
        self.finish(error.to_string());
    }

    fn finish(&self, reason: String) {
        if self
            .closed_fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.should_reconnect.store(false, Ordering::Release);
        self.state.set(ConnectionState::Closed);
        self.pending.fail_all(&reason);

        if let Some(observer) = self.transport_observer.lock().take() {
            self.transport.observers().remove(observer);
        }

        let removed: Vec<Arc<Subscription>> = std::mem::take(&mut *self.subscriptions.lock());
        for subscription in removed.iter().filter(|s| s.is_user()) {
            self.emit_status(subscription.id(), SubscriptionStatus::Closed);
        }

        info!("[connection {}] closed: {}", self.id(), reason);
        self.events.emit(&ConnectionEvent::Closed { reason });
    }

    fn emit_status(&self, subscription_id: u64, status: SubscriptionStatus) {
        self.events.emit(&ConnectionEvent::SubscriptionStatus {
            subscription_id,
            status,
        });
    }
}

fn exhausted(attempts: u32, max: Option<u32>) -> bool {
    max.map_or(false, |max| attempts >= max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc;

    /// Connector that hands out sockets whose frames the test controls
    struct LoopbackConnector {
        sockets: mpsc::UnboundedSender<mpsc::UnboundedSender<Option<Frame>>>,
    }

    struct NullSink;

    #[async_trait]
    impl FrameSink for NullSink {
        async fn send(&mut self, _message: WsMessage) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct ChannelSource(mpsc::UnboundedReceiver<Option<Frame>>);

    #[async_trait]
    impl FrameSource for ChannelSource {
        async fn next_frame(&mut self) -> Option<Result<Frame>> {
            self.0.recv().await.flatten().map(Ok)
        }
    }

    #[async_trait]
    impl SocketConnector for LoopbackConnector {
        async fn connect(&self, _url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = self.sockets.send(tx);
            Ok((Box::new(NullSink), Box::new(ChannelSource(rx))))
        }
    }

    fn connection(
        config: SocketConfig,
    ) -> (
        Arc<Connection>,
        mpsc::UnboundedReceiver<mpsc::UnboundedSender<Option<Frame>>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = Arc::new(config);
        let transport = Transport::new(
            1,
            "wss://loopback",
            Arc::clone(&config),
            Arc::new(LoopbackConnector { sockets: tx }),
        );
        let connection = Connection::new(
            transport,
            config,
            Arc::new(JsonRpcProtocol::new("SUBSCRIBE", "UNSUBSCRIBE")),
            Arc::new(IdGenerator::new()),
        );
        (connection, rx)
    }

    #[tokio::test]
    async fn test_pending_match_is_not_delivered_to_subscriptions() {
        let (connection, mut sockets) = connection(SocketConfig::new());
        connection.connect().await.unwrap();
        let socket = sockets.recv().await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        connection.add_handler(None, move |event| {
            seen_clone.lock().push(event.data.clone());
        });

        let waiter = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                connection
                    .send_and_wait(
                        &json!({"id": 5}),
                        Duration::from_secs(1),
                        Arc::new(|m: &Value| m["id"] == 5),
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        socket.send(Some(Frame::text(r#"{"id":5,"result":null}"#))).unwrap();
        socket.send(Some(Frame::text(r#"{"e":"trade"}"#))).unwrap();

        assert_eq!(waiter.await.unwrap().unwrap()["id"], 5);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock(), vec![json!({"e": "trade"})]);
    }

    #[tokio::test]
    async fn test_unhandled_and_malformed_messages() {
        let (connection, mut sockets) = connection(SocketConfig::new());
        connection.connect().await.unwrap();
        let socket = sockets.recv().await.unwrap();

        let unhandled = Arc::new(Mutex::new(Vec::new()));
        let unhandled_clone = Arc::clone(&unhandled);
        connection.events().add(move |event| {
            if let ConnectionEvent::Unhandled(raw) = event {
                unhandled_clone.lock().push(raw.clone());
            }
        });

        socket.send(Some(Frame::text("not json"))).unwrap();
        socket.send(Some(Frame::text(r#"{"orphan":true}"#))).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(*unhandled.lock(), vec![r#"{"orphan":true}"#.to_string()]);
        assert!(connection.is_open());
    }

    #[tokio::test]
    async fn test_concurrent_close_events_start_one_loop() {
        let config = SocketConfig::new().reconnect_interval(Duration::from_millis(50));
        let (connection, mut sockets) = connection(config);
        connection.connect().await.unwrap();
        let _socket = sockets.recv().await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let connection = Arc::clone(&connection);
                tokio::spawn(async move {
                    connection.handle_transport_closed(format!("drop {}", i));
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(connection.reconnect_loops_started(), 1);
        assert_eq!(connection.state(), ConnectionState::Reconnecting);

        let _second = sockets.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(connection.state(), ConnectionState::Open);
        assert!(!connection.is_reconnecting());

        connection.close("test done").await;
    }

    #[tokio::test]
    async fn test_begin_close_stops_selection_before_teardown() {
        let (connection, mut sockets) = connection(SocketConfig::new());
        connection.connect().await.unwrap();
        let _socket = sockets.recv().await.unwrap();
        assert!(connection.is_usable());

        assert!(connection.begin_close());
        assert!(!connection.is_usable());
        assert_eq!(connection.state(), ConnectionState::Closing);
        assert!(!connection.begin_close());

        // A plain close now leaves the teardown to the first caller
        connection.close("second").await;
        assert_eq!(connection.state(), ConnectionState::Closing);

        connection.complete_close("retired".into()).await;
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_is_terminal_and_fires_once() {
        let (connection, mut sockets) = connection(SocketConfig::new());
        connection.connect().await.unwrap();
        let _socket = sockets.recv().await.unwrap();

        let closed = Arc::new(AtomicU32::new(0));
        let closed_clone = Arc::clone(&closed);
        connection.events().add(move |event| {
            if matches!(event, ConnectionEvent::Closed { .. }) {
                closed_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        let ticket_waiter = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                connection
                    .send_and_wait(
                        &json!({"id": 1}),
                        Duration::from_secs(5),
                        Arc::new(|_: &Value| false),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        connection.close("bye").await;
        connection.close("again").await;

        assert!(matches!(
            ticket_waiter.await.unwrap(),
            Err(SocketError::ConnectionClosed(_))
        ));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(connection.connect().await.is_err());
    }

    #[test]
    fn test_exhausted() {
        assert!(!exhausted(5, None));
        assert!(!exhausted(2, Some(3)));
        assert!(exhausted(3, Some(3)));
    }
}
