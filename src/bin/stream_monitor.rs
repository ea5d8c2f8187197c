//! Stream Monitor
//!
//! Subscribes to the configured topics, keeps the sessions alive across
//! disconnects and logs what happens to them.
//!
//! Usage: `stream-monitor [config.yaml]` (default: `$CLIENT_CONFIG_PATH` or
//! `config/client.yaml`).

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use exchange_client::bin_common::{
    parse_args, resolve_config_path, BinaryRunner, ConfigType, RunConfig,
};
use exchange_client::logging::init_tracing;
use exchange_client::socketmux::{
    ConnectionEvent, JsonRpcProtocol, SessionEvent, SessionManager, SubscribeRequest,
    SubscriptionHandle, TungsteniteConnector,
};
use exchange_client::timesync::{ClockSyncService, NoTimeSource, SyncMode};
use exchange_client::{ClientSettings, HttpTimeSource, SignedRequestGate};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(250);

struct StreamMonitor {
    run_config: RunConfig,
    settings: ClientSettings,
    protocol: Arc<JsonRpcProtocol>,
    manager: SessionManager,
    events: Receiver<SessionEvent>,
    clock: Option<ClockSyncService>,
    handles: Vec<SubscriptionHandle>,
    received: Arc<AtomicU64>,
}

impl StreamMonitor {
    fn new(settings: ClientSettings) -> Self {
        let protocol = Arc::new(JsonRpcProtocol::new(
            settings.streams.subscribe_method.clone(),
            settings.streams.unsubscribe_method.clone(),
        ));
        let manager = SessionManager::new(
            settings.socket_config(),
            protocol.clone(),
            Arc::new(TungsteniteConnector::new()),
        );
        let events = manager.event_channel();
        let clock = Self::build_clock(&settings);

        Self {
            run_config: RunConfig::new("Stream Monitor").with_heartbeat(60),
            settings,
            protocol,
            manager,
            events,
            clock,
            handles: Vec::new(),
            received: Arc::new(AtomicU64::new(0)),
        }
    }

    fn build_clock(settings: &ClientSettings) -> Option<ClockSyncService> {
        let config = settings.clock_config();
        match (&settings.clock.time_url, config.mode) {
            (Some(url), _) => {
                let source = HttpTimeSource::new(url.clone(), settings.clock.time_field.clone());
                Some(ClockSyncService::new(config, Arc::new(source)))
            }
            (None, SyncMode::Manual) => {
                let offset = settings.clock.offset_ms?;
                let clock = ClockSyncService::new(config, Arc::new(NoTimeSource));
                clock.set_offset(offset);
                Some(clock)
            }
            (None, _) => None,
        }
    }

    async fn start_clock(&self, shutdown: &CancellationToken) -> Result<()> {
        let Some(clock) = &self.clock else {
            info!("Clock sync disabled");
            return Ok(());
        };

        clock.start();
        if clock.config().mode == SyncMode::Manual && !clock.is_synchronized() {
            // Manual mode only samples on request
            if let Err(e) = clock.sync_now().await {
                warn!("Initial clock sample failed: {}", e);
                return Ok(());
            }
        }

        let latency = clock
            .wait_for_start(shutdown)
            .await
            .context("waiting for the first clock sample")?;
        info!(
            "Clock synchronized in {:?} (offset {} ms)",
            latency,
            clock.offset_millis()
        );

        let gate = SignedRequestGate::new(self.settings.credentials.clone(), clock.clone());
        if gate.has_credentials() {
            let context = gate.prepare().await?;
            info!("Signed requests ready, timestamp {}", context.timestamp);
        }
        Ok(())
    }

    async fn subscribe_topics(&mut self) -> Result<()> {
        let topics = self.settings.streams.topics.clone();
        for chunk in topics.chunks(self.settings.streams.topics_per_request) {
            let streams: HashSet<String> = chunk.iter().cloned().collect();
            let request = SubscribeRequest::with_request(
                self.settings.streams.url.clone(),
                self.protocol.subscribe_request(json!(chunk)),
            )
            .filter(move |message: &Value| {
                message
                    .get("stream")
                    .and_then(Value::as_str)
                    .map_or(false, |stream| streams.contains(stream))
            });

            let received = self.received.clone();
            let handle = self
                .manager
                .subscribe(request, move |event| {
                    received.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "[connection {}] subscription {}: {}",
                        event.connection_id, event.subscription_id, event.raw
                    );
                })
                .await
                .with_context(|| format!("subscribing to {:?}", chunk))?;

            info!(
                "Subscribed to {:?} (subscription {}, connection {})",
                chunk,
                handle.id(),
                handle.connection_id()
            );
            self.handles.push(handle);
        }
        Ok(())
    }

    fn drain_events(&self) {
        for SessionEvent {
            connection_id,
            url,
            event,
        } in self.events.try_iter()
        {
            match event {
                ConnectionEvent::Opened => info!("[connection {}] opened {}", connection_id, url),
                ConnectionEvent::Lost { reason } => {
                    warn!("[connection {}] lost: {}", connection_id, reason)
                }
                ConnectionEvent::Restored { outage } => {
                    info!("[connection {}] restored after {:?}", connection_id, outage)
                }
                ConnectionEvent::Closed { reason } => {
                    warn!("[connection {}] closed: {}", connection_id, reason)
                }
                ConnectionEvent::Unhandled(raw) => {
                    debug!("[connection {}] unhandled: {}", connection_id, raw)
                }
                ConnectionEvent::SubscriptionStatus {
                    subscription_id,
                    status,
                } => info!(
                    "[connection {}] subscription {} {:?}",
                    connection_id, subscription_id, status
                ),
            }
        }
    }

    fn heartbeat(&self) {
        let active = self.handles.iter().filter(|h| h.is_active()).count();
        info!(
            "Heartbeat: {} connections, {}/{} subscriptions active, {} messages",
            self.manager.connection_count(),
            active,
            self.handles.len(),
            self.received.load(Ordering::Relaxed)
        );
        for snapshot in self.manager.snapshots() {
            debug!(
                "  connection {}: {:?}, {} subs, {} in / {} out, {} reconnects",
                snapshot.id,
                snapshot.state,
                snapshot.user_subscriptions,
                snapshot.messages_received,
                snapshot.messages_sent,
                snapshot.reconnect_count
            );
        }
        if let Some(clock) = &self.clock {
            let stats = clock.stats();
            info!(
                "Clock: offset {} ms, {} samples, {} missed",
                stats.offset_millis, stats.successful, stats.missed
            );
        }
    }
}

impl BinaryRunner for StreamMonitor {
    async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        self.settings.log();
        self.start_clock(&shutdown).await?;
        self.subscribe_topics().await?;

        let mut heartbeat = tokio::time::interval(self.run_config.heartbeat_interval());
        let mut poll = tokio::time::interval(EVENT_POLL_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = poll.tick() => self.drain_events(),
                _ = heartbeat.tick() => self.heartbeat(),
            }
        }
        Ok(())
    }

    async fn cleanup(&mut self) -> Option<String> {
        self.manager.unsubscribe_all().await;
        self.drain_events();
        if let Some(clock) = &self.clock {
            clock.stop().await;
        }
        Some(format!(
            "Received {} messages",
            self.received.load(Ordering::Relaxed)
        ))
    }

    fn config(&self) -> &RunConfig {
        &self.run_config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let config_path = resolve_config_path(&parse_args(), ConfigType::Client);
    let settings = ClientSettings::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    init_tracing(&settings.log_level);

    let mut monitor = StreamMonitor::new(settings);
    if let Err(e) = monitor.execute().await {
        error!("Stream monitor failed: {:#}", e);
        return Err(e);
    }
    Ok(())
}
