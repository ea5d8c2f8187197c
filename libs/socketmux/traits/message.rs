/// Outbound message, text or binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl WsMessage {
    /// Get the message as text, if it is text
    pub fn as_text(&self) -> Option<&str> {
        match self {
            WsMessage::Text(s) => Some(s),
            WsMessage::Binary(_) => None,
        }
    }

    /// Get the message as binary, if it is binary
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            WsMessage::Text(_) => None,
            WsMessage::Binary(b) => Some(b),
        }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        match self {
            WsMessage::Text(s) => s.len(),
            WsMessage::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<serde_json::Value> for WsMessage {
    fn from(value: serde_json::Value) -> Self {
        WsMessage::Text(value.to_string())
    }
}

impl From<&serde_json::Value> for WsMessage {
    fn from(value: &serde_json::Value) -> Self {
        WsMessage::Text(value.to_string())
    }
}

impl From<String> for WsMessage {
    fn from(value: String) -> Self {
        WsMessage::Text(value)
    }
}

/// A single frame read from the raw socket.
///
/// Message boundaries do not have to line up with frames: a `Text` or
/// `Binary` frame with `fin == false` starts a fragmented message that is
/// completed by `Continuation` frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text { payload: Vec<u8>, fin: bool },
    Binary { payload: Vec<u8>, fin: bool },
    Continuation { payload: Vec<u8>, fin: bool },
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<String>),
}

impl Frame {
    /// Complete, unfragmented text frame
    pub fn text(text: impl Into<String>) -> Self {
        Frame::Text {
            payload: text.into().into_bytes(),
            fin: true,
        }
    }

    /// Complete, unfragmented binary frame
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Frame::Binary {
            payload: data.into(),
            fin: true,
        }
    }
}
