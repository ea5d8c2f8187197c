use crate::error::Result;
use crate::message::{Frame, WsMessage};
use async_trait::async_trait;

/// Write half of a raw socket
#[async_trait]
pub trait FrameSink: Send {
    /// Perform one underlying write
    async fn send(&mut self, message: WsMessage) -> Result<()>;

    /// Close the output side of the socket
    async fn close(&mut self) -> Result<()>;
}

/// Read half of a raw socket
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, `None` once the stream has ended
    async fn next_frame(&mut self) -> Option<Result<Frame>>;
}

/// Opens raw duplex sockets.
///
/// Called once per connect attempt; every call must produce a brand-new
/// socket, nothing is reused across reconnects.
#[async_trait]
pub trait SocketConnector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)>;
}
