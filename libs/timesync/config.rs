use std::time::Duration;

/// How often the clock is resampled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Offset only changes through explicit calls
    Manual,
    /// Every 10 seconds
    Fast,
    /// Every minute
    Minute,
    /// Every hour
    Hourly,
}

impl SyncMode {
    /// Timer period, `None` for manual mode
    pub fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Manual => None,
            SyncMode::Fast => Some(Duration::from_secs(10)),
            SyncMode::Minute => Some(Duration::from_secs(60)),
            SyncMode::Hourly => Some(Duration::from_secs(3600)),
        }
    }
}

/// What a timestamp consumer does before the first sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsyncedPolicy {
    /// Block (bounded by `max_wait`) until the first sample
    Wait,
    /// Fail immediately
    Reject,
}

#[derive(Debug, Clone)]
pub struct ClockSyncConfig {
    pub mode: SyncMode,

    /// Delay before the first timer sample
    pub initial_delay: Duration,

    pub unsynced_policy: UnsyncedPolicy,

    /// Upper bound on waiting for the first sample under [`UnsyncedPolicy::Wait`]
    pub max_wait: Duration,

    /// Server error code meaning "timestamp out of sync"
    pub timestamp_error_code: Option<i64>,
}

impl Default for ClockSyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Minute,
            initial_delay: Duration::ZERO,
            unsynced_policy: UnsyncedPolicy::Wait,
            max_wait: Duration::from_secs(10),
            timestamp_error_code: None,
        }
    }
}

impl ClockSyncConfig {
    pub fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn unsynced_policy(mut self, policy: UnsyncedPolicy) -> Self {
        self.unsynced_policy = policy;
        self
    }

    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn timestamp_error_code(mut self, code: Option<i64>) -> Self {
        self.timestamp_error_code = code;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_intervals() {
        assert_eq!(SyncMode::Manual.interval(), None);
        assert_eq!(SyncMode::Fast.interval(), Some(Duration::from_secs(10)));
        assert_eq!(SyncMode::Minute.interval(), Some(Duration::from_secs(60)));
        assert_eq!(SyncMode::Hourly.interval(), Some(Duration::from_secs(3600)));
    }
}
