use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic id source for transports and subscriptions.
///
/// One instance is owned by a session manager and handed to everything it
/// creates, so ids are unique per manager without any global state.
#[derive(Debug)]
pub struct IdGenerator {
    next_socket: AtomicU64,
    next_subscription: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            next_socket: AtomicU64::new(1),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn next_socket_id(&self) -> u64 {
        self.next_socket.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_subscription_id(&self) -> u64 {
        self.next_subscription.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
