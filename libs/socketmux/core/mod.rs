//! # Core
//!
//! Building blocks below the session manager, leaves first:
//!
//! - [`reassembly`]: frames to complete messages
//! - [`transport`]: one physical socket with its send and receive loops
//! - [`pending`]: correlation of requests with their answers
//! - [`subscription`]: standing registrations and their callbacks
//! - [`connection`]: a transport plus its subscriptions and reconnect state machine
//! - [`websocket`]: the `tokio-tungstenite` socket connector

pub mod config;
pub mod connection;
pub mod connection_state;
pub mod ids;
pub mod observers;
pub mod pending;
pub mod reassembly;
pub mod subscription;
pub mod transport;
pub mod websocket;

// Re-export main types
pub use config::SocketConfig;
pub use connection::{Connection, ConnectionEvent, ConnectionSnapshot};
pub use connection_state::{
    AtomicConnectionState, AtomicMetrics, AtomicTransportState, ConnectionState, TransportState,
};
pub use ids::IdGenerator;
pub use observers::{ObserverId, ObserverRegistry};
pub use pending::{field_equals, MessageMatcher, PendingRequestTracker, PendingStats, PendingTicket};
pub use reassembly::{AssembledMessage, FrameAssembler};
pub use subscription::{
    DataCallback, DataEvent, SubscribeRequest, Subscription, SubscriptionStatus,
};
pub use transport::{Transport, TransportEvent};
pub use websocket::TungsteniteConnector;
