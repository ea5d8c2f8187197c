//! # Timesync
//!
//! Keeps a running estimate of the offset between this machine's clock and
//! an exchange's clock, so signed requests carry timestamps the server
//! accepts.
//!
//! ## Example
//!
//! ```rust,ignore
//! use timesync::*;
//!
//! let clock = ClockSyncService::new(ClockSyncConfig::new(SyncMode::Minute), source);
//! clock.start();
//! clock.wait_for_start(&CancellationToken::new()).await?;
//! let timestamp = clock.get_timestamp();
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod service;

pub use clock::{LocalClock, ManualClock, NoTimeSource, SystemClock, TimeSource};
pub use config::{ClockSyncConfig, SyncMode, UnsyncedPolicy};
pub use error::{ClockError, Result};
pub use service::{ClockSample, ClockSyncService, ClockSyncStats};
pub use tokio_util::sync::CancellationToken;
