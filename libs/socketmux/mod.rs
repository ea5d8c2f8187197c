//! # Socketmux
//!
//! Multiplexed streaming sessions for exchange clients.
//!
//! Many logical subscriptions and request/response exchanges share a small
//! pool of physical sockets. Connections recover on their own after a drop:
//! they reconnect at a fixed interval, re-authenticate, and resend every
//! confirmed subscription before reporting themselves restored.
//!
//! ## Features
//!
//! - **Pluggable socket seam**: any frame source/sink, `tokio-tungstenite` by default
//! - **Fragment reassembly**: handlers only ever see complete messages
//! - **Request correlation**: per-request matchers and timeouts, completed exactly once
//! - **Supervised reconnects**: one loop per connection, bounded retries, batched resubscription
//! - **Explicit observers**: ordered handler registries plus a polling event channel

pub mod traits;
pub mod core;
pub mod manager;

// Re-export all traits
pub use traits::*;

// Re-export core functionality
pub use crate::core::{
    config, connection, connection_state, ids, observers, pending, reassembly, subscription,
    transport, websocket,
    config::SocketConfig,
    connection::{Connection, ConnectionEvent, ConnectionSnapshot},
    connection_state::{ConnectionState, TransportState},
    ids::IdGenerator,
    observers::{ObserverId, ObserverRegistry},
    pending::{field_equals, MessageMatcher, PendingRequestTracker, PendingStats},
    reassembly::{AssembledMessage, FrameAssembler},
    subscription::{DataEvent, SubscribeRequest, Subscription, SubscriptionStatus},
    transport::{Transport, TransportEvent},
    websocket::TungsteniteConnector,
};

// Re-export manager
pub use manager::{SessionEvent, SessionManager, SubscriptionHandle};
