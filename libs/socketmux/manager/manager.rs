use crate::config::SocketConfig;
use crate::connection::{Connection, ConnectionEvent, ConnectionSnapshot};
use crate::ids::IdGenerator;
use crate::observers::ObserverRegistry;
use crate::pending::MessageMatcher;
use crate::subscription::{DataEvent, SubscribeRequest, Subscription};
use crate::transport::Transport;
use crate::traits::*;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Capacity of the polling event channel; events beyond it are dropped
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A connection event tagged with the connection it came from
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub connection_id: u64,
    pub url: String,
    pub event: ConnectionEvent,
}

/// Caller-side handle of a live subscription
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: u64,
    connection_id: u64,
    connection: Weak<Connection>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Still attached to a live connection
    pub fn is_active(&self) -> bool {
        self.connection
            .upgrade()
            .map_or(false, |c| c.has_subscription(self.id))
    }

    pub async fn unsubscribe(self) -> Result<()> {
        let connection = self.connection.upgrade().ok_or_else(|| {
            SocketError::ConnectionClosed(format!("connection {} is gone", self.connection_id))
        })?;
        connection.unsubscribe(self.id).await
    }
}

/// Pool of connections multiplexing subscriptions and request/response
/// exchanges
///
/// Connection selection runs under a coordination lock so two concurrent
/// subscribes to the same URL share a connection instead of each opening
/// one. The lock is released before connecting and before any handshake.
/// Message routing never touches it.
pub struct SessionManager {
    config: Arc<SocketConfig>,
    protocol: Arc<dyn SocketProtocol>,
    connector: Arc<dyn SocketConnector>,
    byte_interpreter: Arc<dyn ByteInterpreter>,
    text_interpreter: Arc<dyn TextInterpreter>,
    connections: Arc<DashMap<u64, Arc<Connection>>>,
    coordination: tokio::sync::Mutex<()>,
    ids: Arc<IdGenerator>,
    observers: Arc<ObserverRegistry<SessionEvent>>,
    event_tx: Sender<SessionEvent>,
    event_rx: Receiver<SessionEvent>,
}

impl SessionManager {
    pub fn new(
        config: SocketConfig,
        protocol: Arc<dyn SocketProtocol>,
        connector: Arc<dyn SocketConnector>,
    ) -> Self {
        let (event_tx, event_rx) = bounded(EVENT_CHANNEL_CAPACITY);
        Self {
            config: Arc::new(config),
            protocol,
            connector,
            byte_interpreter: Arc::new(Utf8Bytes),
            text_interpreter: Arc::new(IdentityText),
            connections: Arc::new(DashMap::new()),
            coordination: tokio::sync::Mutex::new(()),
            ids: Arc::new(IdGenerator::new()),
            observers: Arc::new(ObserverRegistry::new()),
            event_tx,
            event_rx,
        }
    }

    /// Decoders applied by every transport created from now on
    pub fn with_interpreters(
        mut self,
        byte_interpreter: Arc<dyn ByteInterpreter>,
        text_interpreter: Arc<dyn TextInterpreter>,
    ) -> Self {
        self.byte_interpreter = byte_interpreter;
        self.text_interpreter = text_interpreter;
        self
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    /// Synchronous observers of every connection's events
    pub fn observers(&self) -> &ObserverRegistry<SessionEvent> {
        &self.observers
    }

    /// Polling alternative to [`observers`](Self::observers)
    pub fn event_channel(&self) -> Receiver<SessionEvent> {
        self.event_rx.clone()
    }

    /// Subscribe on a shared or new connection.
    ///
    /// Returns once the subscription is confirmed. On failure the
    /// subscription is removed again, along with its connection if nothing
    /// else uses it.
    pub async fn subscribe<F>(
        &self,
        request: SubscribeRequest,
        callback: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(&DataEvent<'_>) + Send + Sync + 'static,
    {
        if request.authenticated && !self.protocol.has_credentials() {
            return Err(SocketError::MissingCredentials);
        }
        if request.request.is_none() && request.identifier.is_none() {
            return Err(SocketError::Configuration(
                "subscription needs a request or an identifier".into(),
            ));
        }

        let subscription = Arc::new(Subscription::new(
            self.ids.next_subscription_id(),
            &request,
            Arc::new(callback),
        ));

        let connection = {
            let _guard = self.coordination.lock().await;
            let connection = self.select_connection(&request.url, request.authenticated)?;
            connection.add_subscription(Arc::clone(&subscription));
            connection
        };

        debug!(
            "Subscription {} assigned to connection {}",
            subscription.id(),
            connection.id()
        );

        let established = match connection.connect().await {
            Ok(()) => connection.subscribe(&subscription).await,
            Err(e) => Err(e),
        };

        if let Err(e) = established {
            warn!("Subscription {} failed: {}", subscription.id(), e);
            // Retire under the lock so no concurrent subscribe picks it meanwhile
            let retired = {
                let _guard = self.coordination.lock().await;
                connection.remove_subscription(subscription.id());
                connection.user_subscription_count() == 0 && connection.begin_close()
            };
            if retired {
                connection.complete_close("subscribe failed".into()).await;
            }
            return Err(e);
        }

        Ok(SubscriptionHandle {
            id: subscription.id(),
            connection_id: connection.id(),
            connection: Arc::downgrade(&connection),
        })
    }

    /// One-shot request/response on a pooled connection
    pub async fn query(
        &self,
        url: &str,
        payload: &Value,
        matcher: MessageMatcher,
        authenticated: bool,
    ) -> Result<Value> {
        if authenticated && !self.protocol.has_credentials() {
            return Err(SocketError::MissingCredentials);
        }
        let connection = self.acquire(url, authenticated).await?;
        connection
            .send_and_wait(payload, self.config.response_timeout, matcher)
            .await
    }

    /// Fire-and-forget on a pooled connection
    pub async fn send(&self, url: &str, payload: impl Into<WsMessage>) -> Result<()> {
        let connection = self.acquire(url, false).await?;
        connection.send(payload)
    }

    pub async fn unsubscribe(&self, subscription_id: u64) -> Result<()> {
        let connection = self
            .connections
            .iter()
            .find(|entry| entry.value().has_subscription(subscription_id))
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                SocketError::InvalidState(format!("subscription {} not found", subscription_id))
            })?;
        connection.unsubscribe(subscription_id).await
    }

    /// Close every connection concurrently and wait for all of them
    pub async fn unsubscribe_all(&self) {
        let connections = self.snapshot_connections();
        info!("Closing {} connections", connections.len());
        join_all(connections.iter().map(|c| c.close("unsubscribe all"))).await;
        self.connections.clear();
    }

    /// Force every open connection through the reconnect path
    pub async fn reconnect_all(&self) {
        let connections = self.snapshot_connections();
        join_all(connections.iter().map(|c| c.reconnect())).await;
    }

    /// Close connections without user subscriptions; returns how many
    pub async fn prune_idle(&self) -> usize {
        let idle: Vec<Arc<Connection>> = self
            .snapshot_connections()
            .into_iter()
            .filter(|c| c.user_subscription_count() == 0)
            .collect();
        join_all(idle.iter().map(|c| c.close("idle"))).await;
        idle.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// User subscriptions across the pool
    pub fn subscription_count(&self) -> usize {
        self.snapshot_connections()
            .iter()
            .map(|c| c.user_subscription_count())
            .sum()
    }

    pub fn connection(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn snapshots(&self) -> Vec<ConnectionSnapshot> {
        let mut snapshots: Vec<_> = self
            .snapshot_connections()
            .iter()
            .map(|c| c.snapshot())
            .collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    fn snapshot_connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    async fn acquire(&self, url: &str, authenticated: bool) -> Result<Arc<Connection>> {
        let connection = {
            let _guard = self.coordination.lock().await;
            self.select_connection(url, authenticated)?
        };
        connection.connect().await?;
        if authenticated {
            connection.authenticate().await?;
        }
        Ok(connection)
    }

    /// Pick the least-loaded compatible connection below the combine target,
    /// over-subscribe when the pool is full, otherwise create one.
    ///
    /// Must be called with the coordination lock held.
    fn select_connection(&self, url: &str, authenticated: bool) -> Result<Arc<Connection>> {
        let least_loaded = self
            .snapshot_connections()
            .into_iter()
            .filter(|c| c.url() == url && c.is_usable())
            .filter(|c| !authenticated || c.is_authenticated())
            .map(|c| (c.user_subscription_count(), c))
            .min_by_key(|(load, c)| (*load, c.id()));

        if let Some((load, connection)) = &least_loaded {
            if *load < self.config.subscription_combine_target {
                return Ok(Arc::clone(connection));
            }
        }

        if let Some(max) = self.config.max_connections {
            if self.connections.len() >= max {
                return match least_loaded {
                    Some((load, connection)) => {
                        debug!(
                            "Pool full, over-subscribing connection {} ({} subscriptions)",
                            connection.id(),
                            load
                        );
                        Ok(connection)
                    }
                    None => Err(SocketError::PoolExhausted(max)),
                };
            }
        }

        Ok(self.create_connection(url))
    }

    fn create_connection(&self, url: &str) -> Arc<Connection> {
        let id = self.ids.next_socket_id();
        let transport = Transport::with_interpreters(
            id,
            url,
            Arc::clone(&self.config),
            Arc::clone(&self.connector),
            Arc::clone(&self.byte_interpreter),
            Arc::clone(&self.text_interpreter),
        );
        let connection = Connection::new(
            transport,
            Arc::clone(&self.config),
            Arc::clone(&self.protocol),
            Arc::clone(&self.ids),
        );

        let pool = Arc::downgrade(&self.connections);
        let observers = Arc::clone(&self.observers);
        let event_tx = self.event_tx.clone();
        let event_url = url.to_string();
        connection.events().add(move |event| {
            if matches!(event, ConnectionEvent::Closed { .. }) {
                if let Some(pool) = pool.upgrade() {
                    pool.remove(&id);
                }
            }

            let session_event = SessionEvent {
                connection_id: id,
                url: event_url.clone(),
                event: event.clone(),
            };
            observers.emit(&session_event);
            if let Err(TrySendError::Full(_)) = event_tx.try_send(session_event) {
                debug!("Event channel full, dropping event from connection {}", id);
            }
        });

        self.connections.insert(id, Arc::clone(&connection));
        info!("Created connection {} to {}", id, url);
        connection
    }
}
