//! # Session Manager
//!
//! Owns the connection pool. Decides whether a subscription can share an
//! existing connection or needs a new one, enforces the pool-wide limit and
//! republishes every connection event as a [`SessionEvent`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use socketmux::*;
//!
//! let manager = SessionManager::new(
//!     SocketConfig::new().subscription_combine_target(20),
//!     Arc::new(JsonRpcProtocol::new("SUBSCRIBE", "UNSUBSCRIBE")),
//!     Arc::new(TungsteniteConnector::new()),
//! );
//!
//! let handle = manager
//!     .subscribe(
//!         SubscribeRequest::with_request(url, request),
//!         |event| println!("{}", event.raw),
//!     )
//!     .await?;
//!
//! handle.unsubscribe().await?;
//! ```

pub mod manager;

pub use manager::{SessionEvent, SessionManager, SubscriptionHandle};
