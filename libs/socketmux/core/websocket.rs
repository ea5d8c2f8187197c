//! `tokio-tungstenite` implementation of the raw socket seam

use crate::traits::*;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens websocket connections, optionally with extra handshake headers
#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector {
    headers: Vec<(String, String)>,
}

impl TungsteniteConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header sent with every handshake
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        let mut request = url
            .into_client_request()
            .map_err(|e| SocketError::ConnectFailed(format!("invalid url {}: {}", url, e)))?;

        for (key, value) in &self.headers {
            match (
                key.parse::<http::header::HeaderName>(),
                value.parse::<http::header::HeaderValue>(),
            ) {
                (Ok(name), Ok(value)) => {
                    request.headers_mut().insert(name, value);
                }
                _ => warn!("Skipping invalid header '{}'", key),
            }
        }

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| SocketError::ConnectFailed(e.to_string()))?;
        debug!("Websocket handshake with {} complete", url);

        let (write, read) = stream.split();
        Ok((
            Box::new(TungsteniteSink { write }),
            Box::new(TungsteniteSource { read }),
        ))
    }
}

struct TungsteniteSink {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for TungsteniteSink {
    async fn send(&mut self, message: WsMessage) -> Result<()> {
        let message = match message {
            WsMessage::Text(text) => Message::Text(text),
            WsMessage::Binary(data) => Message::Binary(data),
        };
        self.write
            .send(message)
            .await
            .map_err(|e| SocketError::WebSocket(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.write
            .close()
            .await
            .map_err(|e| SocketError::WebSocket(e.to_string()))
    }
}

struct TungsteniteSource {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for TungsteniteSource {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        loop {
            let message = match self.read.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(SocketError::WebSocket(e.to_string()))),
            };

            // tungstenite already joins fragments, so data frames arrive final
            let frame = match message {
                Message::Text(text) => Frame::Text {
                    payload: text.into_bytes(),
                    fin: true,
                },
                Message::Binary(data) => Frame::Binary {
                    payload: data,
                    fin: true,
                },
                Message::Ping(data) => Frame::Ping(data),
                Message::Pong(data) => Frame::Pong(data),
                Message::Close(close) => Frame::Close(close.map(|c| c.reason.into_owned())),
                Message::Frame(_) => continue,
            };
            return Some(Ok(frame));
        }
    }
}
