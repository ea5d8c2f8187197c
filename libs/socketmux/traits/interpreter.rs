//! Pluggable decoding of assembled messages
//!
//! Binary messages go through a [`ByteInterpreter`], text messages through a
//! [`TextInterpreter`]. Both produce the string that is handed to the
//! connection for routing. Exchanges that gzip their binary frames plug a
//! decompressing byte interpreter in here.

use crate::error::{Result, SocketError};

/// Turns an assembled binary message into text
pub trait ByteInterpreter: Send + Sync {
    fn interpret(&self, data: &[u8]) -> Result<String>;
}

/// Rewrites an assembled text message before routing
pub trait TextInterpreter: Send + Sync {
    fn interpret(&self, text: String) -> Result<String>;
}

/// Decodes binary payloads as UTF-8
pub struct Utf8Bytes;

impl ByteInterpreter for Utf8Bytes {
    fn interpret(&self, data: &[u8]) -> Result<String> {
        String::from_utf8(data.to_vec())
            .map_err(|e| SocketError::Protocol(format!("binary message is not UTF-8: {}", e)))
    }
}

/// Passes text through untouched
pub struct IdentityText;

impl TextInterpreter for IdentityText {
    fn interpret(&self, text: String) -> Result<String> {
        Ok(text)
    }
}

impl<F> ByteInterpreter for F
where
    F: Fn(&[u8]) -> Result<String> + Send + Sync,
{
    fn interpret(&self, data: &[u8]) -> Result<String> {
        self(data)
    }
}

/// Closure adapter for text interpreters
pub struct TextFn<F>(pub F);

impl<F> TextInterpreter for TextFn<F>
where
    F: Fn(String) -> Result<String> + Send + Sync,
{
    fn interpret(&self, text: String) -> Result<String> {
        (self.0)(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf8_bytes() {
        assert_eq!(Utf8Bytes.interpret(b"{\"a\":1}").unwrap(), "{\"a\":1}");
        assert!(matches!(
            Utf8Bytes.interpret(&[0xff, 0xfe]),
            Err(SocketError::Protocol(_))
        ));
    }

    #[test]
    fn test_closure_interpreters() {
        let upper = |data: &[u8]| -> Result<String> { Ok(String::from_utf8_lossy(data).to_uppercase()) };
        assert_eq!(ByteInterpreter::interpret(&upper, b"abc").unwrap(), "ABC");

        let trim = TextFn(|text: String| -> Result<String> { Ok(text.trim().to_string()) });
        assert_eq!(trim.interpret("  x ".to_string()).unwrap(), "x");
        assert_eq!(IdentityText.interpret("y".to_string()).unwrap(), "y");
    }
}
