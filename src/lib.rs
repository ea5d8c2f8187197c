//! Exchange Client - Main Library
//!
//! Streaming and clock plumbing for exchange API clients.
//!
//! ## Architecture
//!
//! - **socketmux**: pooled websocket sessions with reconnect and resubscribe (re-exported)
//! - **timesync**: clock offset estimation for signed requests (re-exported)
//! - **config**: YAML settings and environment credentials
//! - **signing**: gate that hands the signer credentials and a corrected timestamp
//! - **rest**: HTTP collaborators such as the server time source
//! - **bin_common**: Common utilities for binary executables (CLI, runners)
//!
//! ## Usage in Binaries
//!
//! ```rust,ignore
//! use exchange_client::bin_common::{load_config_from_env, ConfigType};
//! use exchange_client::ClientSettings;
//!
//! let settings = ClientSettings::load(load_config_from_env(ConfigType::Client))?;
//! ```

// Re-export workspace libraries for convenience
pub use socketmux;
pub use timesync;

pub mod config;
pub mod logging;
pub mod rest;
pub mod signing;

pub use config::{ApiCredentials, ClientSettings, ConfigError};
pub use rest::HttpTimeSource;
pub use signing::{GateError, SignedRequestGate, SigningContext};

// Binary common utilities
pub mod bin_common {
    //! Common utilities for binary executables

    pub mod cli;
    pub mod runner;

    pub use cli::{load_config_from_env, parse_args, resolve_config_path, ConfigType};
    pub use runner::{interruptible_sleep, shutdown_on_ctrl_c, BinaryRunner, RunConfig};
}
