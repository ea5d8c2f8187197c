use thiserror::Error;

/// Error type for clock synchronization
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClockError {
    /// The remote time query failed
    #[error("Time source error: {0}")]
    Source(String),

    /// Waiting was cancelled by the caller
    #[error("Wait for clock synchronization cancelled")]
    Cancelled,

    /// No successful sample yet
    #[error("Clock not synchronized")]
    NotSynchronized,

    /// Another sample is still running
    #[error("A clock sample is already in progress")]
    SampleInProgress,
}

/// Result type for clock operations
pub type Result<T> = std::result::Result<T, ClockError>;
