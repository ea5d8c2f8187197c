//! Lock-free state and counters shared between a connection and its tasks

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

/// Raw socket state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportState {
    Closed = 0,
    Open = 1,
    Closing = 2,
}

impl TransportState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TransportState::Open,
            2 => TransportState::Closing,
            _ => TransportState::Closed,
        }
    }
}

/// Logical session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Open = 2,
    Reconnecting = 3,
    Closing = 4,
    Closed = 5,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Open,
            3 => ConnectionState::Reconnecting,
            4 => ConnectionState::Closing,
            5 => ConnectionState::Closed,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Atomic wrapper around [`TransportState`]
#[derive(Debug)]
pub struct AtomicTransportState(AtomicU8);

impl AtomicTransportState {
    pub fn new(state: TransportState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    #[inline]
    pub fn get(&self) -> TransportState {
        TransportState::from_u8(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set(&self, state: TransportState) {
        self.0.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.get() == TransportState::Open
    }
}

/// Atomic wrapper around [`ConnectionState`]
#[derive(Debug)]
pub struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    #[inline]
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Transition only if the current state is `current`
    pub fn compare_exchange(
        &self,
        current: ConnectionState,
        new: ConnectionState,
    ) -> Result<ConnectionState, ConnectionState> {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(ConnectionState::from_u8)
            .map_err(ConnectionState::from_u8)
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.get() == ConnectionState::Open
    }

    /// Closing or closed; no new work should be accepted
    #[inline]
    pub fn is_terminating(&self) -> bool {
        matches!(self.get(), ConnectionState::Closing | ConnectionState::Closed)
    }
}

/// Window used for outgoing throughput
const THROUGHPUT_WINDOW: Duration = Duration::from_secs(3);

/// Transport counters
pub struct AtomicMetrics {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    reconnects: AtomicU64,
    recent_sends: Mutex<VecDeque<(Instant, usize)>>,
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            recent_sends: Mutex::new(VecDeque::new()),
        }
    }

    /// Record one underlying write of `bytes` bytes
    pub fn record_send(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);

        let now = Instant::now();
        let mut recent = self.recent_sends.lock();
        recent.push_back((now, bytes));
        while let Some((at, _)) = recent.front() {
            if now.duration_since(*at) > THROUGHPUT_WINDOW {
                recent.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn increment_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Outgoing bytes per second over the last few seconds
    pub fn outgoing_bytes_per_second(&self) -> f64 {
        let now = Instant::now();
        let recent = self.recent_sends.lock();
        let total: usize = recent
            .iter()
            .filter(|(at, _)| now.duration_since(*at) <= THROUGHPUT_WINDOW)
            .map(|(_, bytes)| *bytes)
            .sum();
        total as f64 / THROUGHPUT_WINDOW.as_secs_f64()
    }
}

impl Default for AtomicMetrics {
    fn default() -> Self {
        Self::new()
    }
}
