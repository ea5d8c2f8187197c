//! Local clocks and remote time sources

use crate::error::{ClockError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Local wall clock in Unix milliseconds
pub trait LocalClock: Send + Sync + 'static {
    fn now_millis(&self) -> i64;
}

/// Wall clock of this machine
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl LocalClock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(now_millis: i64) -> Self {
        Self(AtomicI64::new(now_millis))
    }

    pub fn set(&self, now_millis: i64) {
        self.0.store(now_millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.0.fetch_add(millis, Ordering::SeqCst);
    }
}

impl LocalClock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Queries the remote server's current time
#[async_trait]
pub trait TimeSource: Send + Sync + 'static {
    /// Remote time in Unix milliseconds
    async fn fetch_time(&self) -> Result<i64>;
}

/// For clocks whose offset is only ever set by hand
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTimeSource;

#[async_trait]
impl TimeSource for NoTimeSource {
    async fn fetch_time(&self) -> Result<i64> {
        Err(ClockError::Source("no time source configured".to_string()))
    }
}
