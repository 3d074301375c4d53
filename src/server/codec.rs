//! Newline-delimited JSON framing.
//!
//! Every frame on the wire is one UTF-8 JSON object followed by a single `\n`.
//! TCP delivers an undifferentiated byte stream, so a read may carry zero, one
//! or many frames, and a frame may straddle several reads. The decoder keeps the
//! unterminated tail in the connection's read buffer until its delimiter arrives.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::server::message::{MessageError, ServerMessage};

/// Frame delimiter.
pub const DELIMITER: u8 = b'\n';

/// Default upper bound on a single frame, delimiter excluded.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Errors raised while splitting or building frames.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An unterminated frame grew past the configured limit.
    #[error("Frame exceeds {max} bytes")]
    FrameTooLong { max: usize },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Splits a byte stream into `\n`-terminated segments and encodes outbound messages.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Offset into the buffer up to which no delimiter was found on the last pass.
    next_index: usize,
    max_length: usize,
}

impl FrameCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            next_index: 0,
            max_length,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = CodecError;

    /// Extracts the next complete segment from `buf`, leaving any partial tail in place.
    ///
    /// Blank segments (consecutive delimiters, whitespace-only lines) are skipped.
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        loop {
            let read_to = buf.len();
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == DELIMITER);

            match newline {
                Some(offset) => {
                    let index = self.next_index + offset;
                    self.next_index = 0;

                    let mut segment = buf.split_to(index + 1);
                    segment.truncate(index);

                    if segment.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    if segment.len() > self.max_length {
                        return Err(CodecError::FrameTooLong {
                            max: self.max_length,
                        });
                    }
                    return Ok(Some(segment.freeze()));
                }
                None => {
                    if read_to > self.max_length {
                        return Err(CodecError::FrameTooLong {
                            max: self.max_length,
                        });
                    }
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        if let Some(segment) = self.decode(buf)? {
            return Ok(Some(segment));
        }
        if !buf.is_empty() {
            debug!("Discarding {} unterminated bytes at end of stream", buf.len());
            buf.clear();
        }
        self.next_index = 0;
        Ok(None)
    }
}

impl<'a> Encoder<&'a ServerMessage> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, message: &'a ServerMessage, dst: &mut BytesMut) -> Result<(), CodecError> {
        serde_json::to_writer((&mut *dst).writer(), message)?;
        dst.put_u8(DELIMITER);
        Ok(())
    }
}

/// Parses one segment as a JSON value.
///
/// Only syntax is checked here; type-specific schemas are the router's concern.
pub fn decode_message(segment: &[u8]) -> Result<Value, MessageError> {
    serde_json::from_slice(segment).map_err(|_| MessageError::Malformed)
}

/// Serializes a message into a complete wire frame.
pub fn encode(message: &ServerMessage) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(128);
    FrameCodec::default().encode(message, &mut buf)?;
    Ok(buf.freeze())
}

/// Re-frames raw inbound bytes for verbatim forwarding.
pub fn reframe(segment: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(segment.len() + 1);
    buf.extend_from_slice(segment);
    buf.put_u8(DELIMITER);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drain(codec: &mut FrameCodec, buf: &mut BytesMut) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn split_frame_waits_for_delimiter() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(br#"{"type":"pi"#);
        assert!(drain(&mut codec, &mut buf).is_empty());

        buf.extend_from_slice(b"ng\"}");
        assert!(drain(&mut codec, &mut buf).is_empty());

        buf.extend_from_slice(b"\n");
        let frames = drain(&mut codec, &mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], br#"{"type":"ping"}"#);
        assert!(buf.is_empty());
    }

    #[test]
    fn concatenated_frames_come_out_in_order() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"{\"type\":\"ping\"}\n{\"type\":\"echo\",\"data\":1}\n{\"ty"[..]);

        let frames = drain(&mut codec, &mut buf);
        assert_eq!(frames.len(), 2);
        assert_eq!(decode_message(&frames[0]).unwrap()["type"], "ping");
        assert_eq!(decode_message(&frames[1]).unwrap()["type"], "echo");
        assert_eq!(&buf[..], b"{\"ty");
    }

    #[test]
    fn blank_segments_are_skipped() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"\n\n  \r\n{\"type\":\"ping\"}\n\n"[..]);

        let frames = drain(&mut codec, &mut buf);
        assert_eq!(frames.len(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = FrameCodec::new(8);
        let mut buf = BytesMut::from(&b"0123456789"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::FrameTooLong { max: 8 })
        ));

        let mut codec = FrameCodec::new(8);
        let mut buf = BytesMut::from(&b"0123456789\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::FrameTooLong { .. })
        ));
    }

    #[test]
    fn eof_discards_partial_tail() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"{\"type\":\"ping\"}\n{\"type\""[..]);

        assert!(codec.decode_eof(&mut buf).unwrap().is_some());
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn invalid_json_is_malformed() {
        assert!(matches!(decode_message(b"{not json"), Err(MessageError::Malformed)));
        assert!(matches!(decode_message(&[0xff, 0xfe]), Err(MessageError::Malformed)));
        // Valid JSON passes even without a usable `type`.
        assert_eq!(decode_message(b"[1,2]").unwrap(), json!([1, 2]));
    }

    #[test]
    fn encode_appends_single_delimiter() {
        let frame = encode(&ServerMessage::Pong { timestamp: 42 }).unwrap();
        assert_eq!(&frame[..], b"{\"type\":\"pong\",\"timestamp\":42}\n");
        assert_eq!(frame.iter().filter(|b| **b == DELIMITER).count(), 1);
    }

    #[test]
    fn reframe_keeps_bytes_verbatim() {
        let raw = br#"{"type":"broadcast",  "x":[1, 2]}"#;
        let frame = reframe(raw);
        assert_eq!(&frame[..raw.len()], &raw[..]);
        assert_eq!(frame[raw.len()], DELIMITER);
    }
}
