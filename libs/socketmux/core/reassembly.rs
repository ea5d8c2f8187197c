//! Reassembly of fragmented messages
//!
//! ```text
//! Text{fin:false} ──┐
//! Continuation ─────┼──> buffer ──> Continuation{fin:true} ──> AssembledMessage
//! Continuation ─────┘
//! ```

use crate::error::{Result, SocketError};
use crate::message::Frame;

/// Complete logical message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssembledMessage {
    Text(Vec<u8>),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Text,
    Binary,
}

/// Accumulates data frames until a message is complete
#[derive(Debug, Default)]
pub struct FrameAssembler {
    kind: Option<Kind>,
    buffer: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one data frame.
    ///
    /// Returns `Ok(Some(message))` once the final fragment arrives and
    /// `Ok(None)` while more fragments are expected. Control frames are not
    /// accepted here. A protocol violation discards the partial message and
    /// resets the assembler, so the next well-formed message still goes
    /// through.
    pub fn push(&mut self, frame: Frame) -> Result<Option<AssembledMessage>> {
        let (kind, payload, fin) = match frame {
            Frame::Text { payload, fin } => (Some(Kind::Text), payload, fin),
            Frame::Binary { payload, fin } => (Some(Kind::Binary), payload, fin),
            Frame::Continuation { payload, fin } => (None, payload, fin),
            other => {
                return Err(SocketError::Protocol(format!(
                    "control frame passed to assembler: {:?}",
                    other
                )))
            }
        };

        match (kind, self.kind) {
            (Some(_), Some(_)) => {
                self.reset();
                return Err(SocketError::Protocol(
                    "new message started before previous fragments completed".into(),
                ));
            }
            (None, None) => {
                return Err(SocketError::Protocol(
                    "continuation frame without a started message".into(),
                ));
            }
            (Some(new_kind), None) => {
                if fin {
                    return Ok(Some(Self::wrap(new_kind, payload)));
                }
                self.kind = Some(new_kind);
                self.buffer = payload;
                return Ok(None);
            }
            (None, Some(_)) => {}
        }

        self.buffer.extend_from_slice(&payload);
        if !fin {
            return Ok(None);
        }

        let kind = self.kind.take().unwrap_or(Kind::Binary);
        let data = std::mem::take(&mut self.buffer);
        Ok(Some(Self::wrap(kind, data)))
    }

    /// Whether a fragmented message is in progress
    pub fn is_partial(&self) -> bool {
        self.kind.is_some()
    }

    /// Drop any buffered fragments
    pub fn reset(&mut self) {
        self.kind = None;
        self.buffer.clear();
    }

    fn wrap(kind: Kind, data: Vec<u8>) -> AssembledMessage {
        match kind {
            Kind::Text => AssembledMessage::Text(data),
            Kind::Binary => AssembledMessage::Binary(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Split `data` at `cuts` into a fragmented frame sequence
    fn fragment(data: &[u8], text: bool, cuts: &[usize]) -> Vec<Frame> {
        let mut bounds: Vec<usize> = cuts
            .iter()
            .copied()
            .filter(|c| *c > 0 && *c < data.len())
            .collect();
        bounds.sort_unstable();
        bounds.dedup();
        bounds.push(data.len());

        let mut frames = Vec::with_capacity(bounds.len());
        let mut start = 0;
        for (i, end) in bounds.iter().enumerate() {
            let payload = data[start..*end].to_vec();
            let fin = i + 1 == bounds.len();
            let frame = match (i, text) {
                (0, true) => Frame::Text { payload, fin },
                (0, false) => Frame::Binary { payload, fin },
                _ => Frame::Continuation { payload, fin },
            };
            frames.push(frame);
            start = *end;
        }
        frames
    }

    #[test]
    fn test_single_frame_message() {
        let mut assembler = FrameAssembler::new();
        let out = assembler.push(Frame::text("hello")).unwrap();
        assert_eq!(out, Some(AssembledMessage::Text(b"hello".to_vec())));
        assert!(!assembler.is_partial());
    }

    #[test]
    fn test_fragmented_message_delivered_once() {
        let mut assembler = FrameAssembler::new();
        let data = br#"{"stream":"book","data":[1,2,3]}"#;
        let frames = fragment(data, true, &[3, 10, 11, 25]);
        assert_eq!(frames.len(), 5);

        let outputs: Vec<_> = frames
            .into_iter()
            .filter_map(|f| assembler.push(f).unwrap())
            .collect();
        assert_eq!(outputs, vec![AssembledMessage::Text(data.to_vec())]);
    }

    #[test]
    fn test_binary_fragments() {
        let mut assembler = FrameAssembler::new();
        let data: Vec<u8> = (0..=255).collect();
        let mut delivered = Vec::new();
        for frame in fragment(&data, false, &[1, 2, 100]) {
            if let Some(msg) = assembler.push(frame).unwrap() {
                delivered.push(msg);
            }
        }
        assert_eq!(delivered, vec![AssembledMessage::Binary(data)]);
    }

    #[test]
    fn test_orphan_continuation_is_rejected() {
        let mut assembler = FrameAssembler::new();
        let err = assembler.push(Frame::Continuation {
            payload: b"x".to_vec(),
            fin: true,
        });
        assert!(matches!(err, Err(SocketError::Protocol(_))));
    }

    #[test]
    fn test_interleaved_start_resets_and_recovers() {
        let mut assembler = FrameAssembler::new();
        assert!(assembler
            .push(Frame::Text { payload: b"ab".to_vec(), fin: false })
            .unwrap()
            .is_none());
        assert!(assembler
            .push(Frame::Text { payload: b"cd".to_vec(), fin: false })
            .is_err());
        assert!(!assembler.is_partial());

        let out = assembler.push(Frame::text("ok")).unwrap();
        assert_eq!(out, Some(AssembledMessage::Text(b"ok".to_vec())));
    }
}
