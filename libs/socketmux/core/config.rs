use std::time::Duration;

/// Configuration shared by every connection of a session manager
///
/// Built with chained setters:
///
/// ```ignore
/// let config = SocketConfig::new()
///     .reconnect_interval(Duration::from_secs(2))
///     .max_reconnect_tries(Some(10))
///     .subscription_combine_target(20);
/// ```
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Reconnect automatically after an unexpected close
    pub auto_reconnect: bool,

    /// Fixed wait before each reconnect attempt
    pub reconnect_interval: Duration,

    /// Give up after this many failed connect attempts (None = unlimited)
    pub max_reconnect_tries: Option<u32>,

    /// Give up after this many failed resubscribe rounds (None = unlimited)
    pub max_resubscribe_tries: Option<u32>,

    /// Subscriptions resent concurrently per batch after a reconnect
    pub max_concurrent_resubscriptions: usize,

    /// Preferred maximum of user subscriptions per connection
    pub subscription_combine_target: usize,

    /// Hard cap on pooled connections (None = unlimited)
    pub max_connections: Option<usize>,

    /// Default wait for the answer to a correlated request
    pub response_timeout: Duration,

    /// Close the transport when nothing arrives for this long
    pub no_data_timeout: Option<Duration>,

    /// Bound on opening the raw socket
    pub connect_timeout: Duration,

    /// Bound on the send/receive loops reporting that they started
    pub startup_timeout: Duration,

    /// Also hand messages that answered a pending request to subscriptions
    pub deliver_answered_to_subscriptions: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_tries: None,
            max_resubscribe_tries: Some(5),
            max_concurrent_resubscriptions: 5,
            subscription_combine_target: 10,
            max_connections: None,
            response_timeout: Duration::from_secs(10),
            no_data_timeout: None,
            connect_timeout: Duration::from_secs(10),
            startup_timeout: Duration::from_secs(5),
            deliver_answered_to_subscriptions: false,
        }
    }
}

impl SocketConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn max_reconnect_tries(mut self, tries: Option<u32>) -> Self {
        self.max_reconnect_tries = tries;
        self
    }

    pub fn max_resubscribe_tries(mut self, tries: Option<u32>) -> Self {
        self.max_resubscribe_tries = tries;
        self
    }

    pub fn max_concurrent_resubscriptions(mut self, batch: usize) -> Self {
        self.max_concurrent_resubscriptions = batch.max(1);
        self
    }

    pub fn subscription_combine_target(mut self, target: usize) -> Self {
        self.subscription_combine_target = target.max(1);
        self
    }

    pub fn max_connections(mut self, max: Option<usize>) -> Self {
        self.max_connections = max;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn no_data_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.no_data_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn deliver_answered_to_subscriptions(mut self, enabled: bool) -> Self {
        self.deliver_answered_to_subscriptions = enabled;
        self
    }
}
