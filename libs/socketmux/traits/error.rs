use std::time::Duration;
use thiserror::Error;

/// Main error type for socketmux
#[derive(Error, Debug, Clone)]
pub enum SocketError {
    /// Error reported by the underlying socket
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The remote host could not be reached or refused the handshake
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Connection closed while an operation was in flight
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// No response arrived within the allowed time
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Send/receive loops did not report readiness in time
    #[error("Transport loops did not start within {0:?}")]
    StartupTimeout(Duration),

    /// Server answered a subscribe request with a rejection
    #[error("Subscription rejected: {0}")]
    SubscriptionRejected(String),

    /// Server rejected the authentication request
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Authenticated operation attempted without credentials
    #[error("No credentials configured for authenticated operation")]
    MissingCredentials,

    /// The pool already holds the maximum number of connections
    #[error("Connection pool exhausted ({0} connections)")]
    PoolExhausted(usize),

    /// Reconnection gave up
    #[error("Reconnection failed after {attempts} attempts: {reason}")]
    ReconnectionFailed { attempts: u32, reason: String },

    /// Inbound data could not be decoded
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Outbound queue is gone
    #[error("Channel send error: {0}")]
    ChannelSend(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl SocketError {
    /// Transport-level failures are retried by the reconnect loop
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SocketError::WebSocket(_)
                | SocketError::ConnectFailed(_)
                | SocketError::ConnectionClosed(_)
                | SocketError::StartupTimeout(_)
        )
    }
}

/// Result type for socketmux operations
pub type Result<T> = std::result::Result<T, SocketError>;
