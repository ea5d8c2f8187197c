//! # Socket Traits
//!
//! The seams the session layer is built around:
//!
//! - **SocketConnector / FrameSink / FrameSource**: the raw byte/frame socket
//! - **ByteInterpreter / TextInterpreter**: decoding of assembled messages
//! - **SocketProtocol**: exchange-specific request/answer conventions
//!
//! ## Example
//!
//! ```rust,ignore
//! use socketmux::traits::*;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl SocketConnector for Echo {
//!     async fn connect(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
//!         // open the raw socket here
//!     }
//! }
//! ```

pub mod error;
pub mod interpreter;
pub mod message;
pub mod protocol;
pub mod socket;

pub use error::{Result, SocketError};
pub use interpreter::{ByteInterpreter, IdentityText, TextFn, TextInterpreter, Utf8Bytes};
pub use message::{Frame, WsMessage};
pub use protocol::{JsonRpcProtocol, SocketProtocol};
pub use socket::{FrameSink, FrameSource, SocketConnector};
