//! Common test utilities for timesync integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use timesync::*;

/// Macro for verbose test output (controlled by TEST_VERBOSE env var)
#[macro_export]
macro_rules! verbose_println {
    ($($arg:tt)*) => {
        if std::env::var("TEST_VERBOSE").is_ok() {
            println!($($arg)*);
        }
    };
}

/// Time source replaying queued answers, then repeating a fallback
pub struct ScriptedTimeSource {
    answers: Mutex<VecDeque<Result<i64>>>,
    fallback: Mutex<Result<i64>>,
    delay: Duration,
    calls: AtomicU32,
}

impl ScriptedTimeSource {
    pub fn new(fallback: i64) -> Self {
        Self::with_delay(fallback, Duration::ZERO)
    }

    /// Every fetch takes `delay` before answering
    pub fn with_delay(fallback: i64, delay: Duration) -> Self {
        Self {
            answers: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Ok(fallback)),
            delay,
            calls: AtomicU32::new(0),
        }
    }

    pub fn push(&self, answer: Result<i64>) {
        self.answers.lock().push_back(answer);
    }

    pub fn set_fallback(&self, answer: Result<i64>) {
        *self.fallback.lock() = answer;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TimeSource for ScriptedTimeSource {
    async fn fetch_time(&self) -> Result<i64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let queued = self.answers.lock().pop_front();
        queued.unwrap_or_else(|| self.fallback.lock().clone())
    }
}

pub fn offline() -> ClockError {
    ClockError::Source("network unreachable".to_string())
}
