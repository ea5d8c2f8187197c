//! Clock synchronization service
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │  Timer Task         │
//! │  (Tokio spawn)      │   fetch_time()    ┌─────────────┐
//! │  every interval: ───┼─────────────────> │ TimeSource  │
//! │  offset = remote    │ <─────────────────┤ (REST, ...) │
//! │         - local     │                   └─────────────┘
//! └─────────┬───────────┘
//!           │ store under lock
//!           ▼
//!     offset (atomic) ──> get_timestamp() = local now + offset
//! ```
//!
//! A failed sample is counted and otherwise ignored; the previous offset
//! stays in effect until the next tick succeeds. Samples never overlap: a
//! sample requested while another one runs is skipped and counted.

use crate::clock::{LocalClock, SystemClock, TimeSource};
use crate::config::{ClockSyncConfig, UnsyncedPolicy};
use crate::error::{ClockError, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One successful measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSample {
    pub remote_millis: i64,
    pub local_millis: i64,
    pub offset_millis: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClockSyncStats {
    pub attempted: u64,
    pub successful: u64,
    pub missed: u64,
    pub skipped: u64,
    pub corrections: u64,
    pub last_sample: Option<ClockSample>,
    pub offset_millis: i64,
    pub synchronized: bool,
}

struct Inner {
    config: ClockSyncConfig,
    source: Arc<dyn TimeSource>,
    clock: Arc<dyn LocalClock>,
    offset: AtomicI64,
    last_sample: RwLock<Option<ClockSample>>,
    sampling: AtomicBool,
    started: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    startup_latency: Mutex<Option<Duration>>,
    synced: watch::Sender<bool>,
    attempted: AtomicU64,
    successful: AtomicU64,
    missed: AtomicU64,
    skipped: AtomicU64,
    corrections: AtomicU64,
    shutdown: CancellationToken,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Releases the sampling flag even if the sample future is dropped
struct SamplingGuard<'a>(&'a AtomicBool);

impl<'a> SamplingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for SamplingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Shared handle to the clock offset estimate.
///
/// Cloning is cheap and every clone observes the same state. Create one per
/// process and pass it to whatever signs requests.
#[derive(Clone)]
pub struct ClockSyncService {
    inner: Arc<Inner>,
}

impl ClockSyncService {
    pub fn new(config: ClockSyncConfig, source: Arc<dyn TimeSource>) -> Self {
        Self::with_clock(config, source, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: ClockSyncConfig,
        source: Arc<dyn TimeSource>,
        clock: Arc<dyn LocalClock>,
    ) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                source,
                clock,
                offset: AtomicI64::new(0),
                last_sample: RwLock::new(None),
                sampling: AtomicBool::new(false),
                started: AtomicBool::new(false),
                started_at: Mutex::new(None),
                startup_latency: Mutex::new(None),
                synced,
                attempted: AtomicU64::new(0),
                successful: AtomicU64::new(0),
                missed: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
                corrections: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                timer: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ClockSyncConfig {
        &self.inner.config
    }

    /// Start the periodic timer. Later calls are no-ops, also after `stop()`.
    pub fn start(&self) {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Clock sync already started");
            return;
        }

        *self.inner.started_at.lock() = Some(Instant::now());

        let Some(period) = self.inner.config.mode.interval() else {
            info!("Clock sync started in manual mode");
            return;
        };

        info!(
            "Clock sync started: every {:?} after {:?}",
            period, self.inner.config.initial_delay
        );
        let service = self.clone();
        let handle = tokio::spawn(async move { service.run_timer(period).await });
        *self.inner.timer.lock() = Some(handle);
    }

    /// Cancel the timer and wait for it to finish
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let timer = self.inner.timer.lock().take();
        if let Some(timer) = timer {
            let _ = timer.await;
            info!("Clock sync stopped");
        }
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    pub fn is_synchronized(&self) -> bool {
        *self.inner.synced.borrow()
    }

    /// Block until the first successful sample or a preset offset.
    ///
    /// Returns the startup latency: time from `start()` to the first sample.
    pub async fn wait_for_start(&self, cancel: &CancellationToken) -> Result<Duration> {
        let mut rx = self.inner.synced.subscribe();
        let synced = async move { rx.wait_for(|synced| *synced).await.map(|_| ()) };

        tokio::select! {
            biased;
            result = synced => {
                result.map_err(|_| ClockError::Cancelled)?;
                Ok(self.startup_latency())
            }
            _ = cancel.cancelled() => Err(ClockError::Cancelled),
        }
    }

    pub fn startup_latency(&self) -> Duration {
        self.inner.startup_latency.lock().unwrap_or_default()
    }

    /// Corrected Unix timestamp in milliseconds, recomputed on every call
    pub fn get_timestamp(&self) -> i64 {
        self.inner.clock.now_millis() + self.inner.offset.load(Ordering::Acquire)
    }

    /// Timestamp for a signed request.
    ///
    /// Before the first sample this waits up to `max_wait` or fails right
    /// away, depending on the configured [`UnsyncedPolicy`].
    pub async fn signing_timestamp(&self) -> Result<i64> {
        if self.is_synchronized() {
            return Ok(self.get_timestamp());
        }

        match self.inner.config.unsynced_policy {
            UnsyncedPolicy::Reject => Err(ClockError::NotSynchronized),
            UnsyncedPolicy::Wait => {
                let cancel = CancellationToken::new();
                match tokio::time::timeout(self.inner.config.max_wait, self.wait_for_start(&cancel))
                    .await
                {
                    Ok(result) => result.map(|_| self.get_timestamp()),
                    Err(_) => {
                        warn!(
                            "Clock not synchronized after {:?}",
                            self.inner.config.max_wait
                        );
                        Err(ClockError::NotSynchronized)
                    }
                }
            }
        }
    }

    pub fn offset_millis(&self) -> i64 {
        self.inner.offset.load(Ordering::Acquire)
    }

    /// Fix the offset by hand; counts as synchronized
    pub fn set_offset(&self, offset_millis: i64) {
        {
            let _last = self.inner.last_sample.write();
            self.inner.offset.store(offset_millis, Ordering::Release);
        }
        info!("Clock offset set to {} ms", offset_millis);
        self.mark_synchronized();
    }

    /// Take one sample now
    pub async fn sync_now(&self) -> Result<ClockSample> {
        let Some(_guard) = SamplingGuard::acquire(&self.inner.sampling) else {
            let skipped = self.inner.skipped.fetch_add(1, Ordering::AcqRel) + 1;
            debug!("Clock sample skipped, one is in progress ({} skipped)", skipped);
            return Err(ClockError::SampleInProgress);
        };

        self.inner.attempted.fetch_add(1, Ordering::AcqRel);
        match self.inner.source.fetch_time().await {
            Ok(remote_millis) => {
                let local_millis = self.inner.clock.now_millis();
                let sample = ClockSample {
                    remote_millis,
                    local_millis,
                    offset_millis: remote_millis - local_millis,
                };

                {
                    let mut last = self.inner.last_sample.write();
                    self.inner.offset.store(sample.offset_millis, Ordering::Release);
                    *last = Some(sample);
                }
                self.inner.successful.fetch_add(1, Ordering::AcqRel);
                debug!("Clock sample: offset {} ms", sample.offset_millis);
                self.mark_synchronized();
                Ok(sample)
            }
            Err(e) => {
                let missed = self.inner.missed.fetch_add(1, Ordering::AcqRel) + 1;
                warn!("Clock sample failed ({} missed): {}", missed, e);
                Err(e)
            }
        }
    }

    /// Out-of-band resync after the server rejected a timestamp
    pub async fn correct(&self) -> Result<ClockSample> {
        let corrections = self.inner.corrections.fetch_add(1, Ordering::AcqRel) + 1;
        info!("Clock correction requested ({} so far)", corrections);
        self.sync_now().await
    }

    /// Trigger a background correction if `code` is the configured
    /// "timestamp out of sync" code. Returns whether one was triggered.
    pub fn handle_error_code(&self, code: i64) -> bool {
        if self.inner.config.timestamp_error_code != Some(code) {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Timestamp error {} reported outside a runtime, not correcting", code);
            return false;
        };

        let service = self.clone();
        runtime.spawn(async move {
            if let Err(e) = service.correct().await {
                debug!("Clock correction failed: {}", e);
            }
        });
        true
    }

    pub fn stats(&self) -> ClockSyncStats {
        ClockSyncStats {
            attempted: self.inner.attempted.load(Ordering::Acquire),
            successful: self.inner.successful.load(Ordering::Acquire),
            missed: self.inner.missed.load(Ordering::Acquire),
            skipped: self.inner.skipped.load(Ordering::Acquire),
            corrections: self.inner.corrections.load(Ordering::Acquire),
            last_sample: *self.inner.last_sample.read(),
            offset_millis: self.offset_millis(),
            synchronized: self.is_synchronized(),
        }
    }

    fn mark_synchronized(&self) {
        if self.is_synchronized() {
            return;
        }
        let latency = self
            .inner
            .started_at
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or_default();
        self.inner.startup_latency.lock().get_or_insert(latency);
        self.inner.synced.send_replace(true);
        info!("Clock synchronized after {:?}", latency);
    }

    async fn run_timer(self, period: Duration) {
        let shutdown = self.inner.shutdown.clone();

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(self.inner.config.initial_delay) => {}
        }

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        // Failures are counted inside and retried next tick
                        _ = self.sync_now() => {}
                    }
                }
            }
        }
        debug!("Clock sync timer exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SyncMode;
    use async_trait::async_trait;

    struct Fixed(i64);

    #[async_trait]
    impl TimeSource for Fixed {
        async fn fetch_time(&self) -> Result<i64> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn test_offset_is_remote_minus_local() {
        let clock = Arc::new(ManualClock::new(1_000));
        let service = ClockSyncService::with_clock(
            ClockSyncConfig::new(SyncMode::Manual),
            Arc::new(Fixed(1_500)),
            clock.clone(),
        );

        let sample = service.sync_now().await.unwrap();
        assert_eq!(sample.offset_millis, 500);
        assert_eq!(service.get_timestamp(), 1_500);

        clock.advance(10);
        assert_eq!(service.get_timestamp(), 1_510);
    }

    #[tokio::test]
    async fn test_set_offset_is_seen_by_next_call() {
        let clock = Arc::new(ManualClock::new(0));
        let service = ClockSyncService::with_clock(
            ClockSyncConfig::new(SyncMode::Manual),
            Arc::new(Fixed(0)),
            clock,
        );
        assert!(!service.is_synchronized());

        service.set_offset(-250);
        assert_eq!(service.get_timestamp(), -250);
        service.set_offset(40);
        assert_eq!(service.get_timestamp(), 40);
        assert_eq!(service.get_timestamp(), 40);
        assert!(service.is_synchronized());
    }

    #[test]
    fn test_sampling_guard_releases_on_drop() {
        let flag = AtomicBool::new(false);
        {
            let _guard = SamplingGuard::acquire(&flag).unwrap();
            assert!(SamplingGuard::acquire(&flag).is_none());
        }
        assert!(SamplingGuard::acquire(&flag).is_some());
    }
}
