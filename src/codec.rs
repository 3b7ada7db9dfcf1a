use bytes::{Buf, BufMut, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{Command, Frame};
use crate::parser::{escape_header_value, parse_frame_slice, unescape_header_value};

/// Default upper bound for a single buffered frame (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Items produced or consumed by the codec.
///
/// A `StompItem` is either a decoded `Frame` or a `Heartbeat` marker
/// representing a single EOL received on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StompItem {
    /// A decoded STOMP frame (command + headers + body)
    Frame(Frame),
    /// A single heartbeat pulse (LF)
    Heartbeat,
}

/// Errors raised by [`StompCodec`].
///
/// `Malformed` is fatal for the connection the bytes came from; there is no
/// way to resynchronise a STOMP stream once a frame fails to parse.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// `StompCodec` implements `tokio_util::codec::{Decoder, Encoder}` for the
/// STOMP wire protocol.
///
/// Responsibilities:
/// - Decode incoming bytes into `StompItem::Frame` or `StompItem::Heartbeat`,
///   leaving partial frames in the buffer until the rest arrives.
/// - Support both NUL-terminated frames and frames using the `content-length`
///   header for binary bodies containing NUL bytes.
/// - Encode `StompItem` back into bytes for the wire format and emit
///   `content-length` when the body could not be framed without it.
#[derive(Debug, Clone)]
pub struct StompCodec {
    max_frame_size: usize,
}

impl StompCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Codec that rejects any frame still incomplete after `max_frame_size`
    /// buffered bytes.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for StompCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn header_text(raw: Vec<u8>, escaped: bool, what: &str) -> Result<String, CodecError> {
    let bytes = if escaped {
        unescape_header_value(&raw)
            .map_err(|e| CodecError::Malformed(format!("invalid escape in header {}: {}", what, e)))?
    } else {
        raw
    };
    String::from_utf8(bytes)
        .map_err(|e| CodecError::Malformed(format!("invalid utf8 in header {}: {}", what, e)))
}

impl Decoder for StompCodec {
    type Item = StompItem;
    type Error = CodecError;

    /// Decode bytes from `src` into a `StompItem`.
    ///
    /// Returns
    /// - `Ok(Some(StompItem))` when a full item (frame or heartbeat) was
    ///   decoded and its bytes were consumed from `src`.
    /// - `Ok(None)` when more bytes are required; `src` is left untouched.
    /// - `Err(CodecError::Malformed)` when the buffered bytes can never form
    ///   a valid frame.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src.first().copied() {
            None => return Ok(None),
            Some(b'\n') => {
                src.advance(1);
                return Ok(Some(StompItem::Heartbeat));
            }
            Some(b'\r') => {
                if src.len() < 2 {
                    return Ok(None);
                }
                if src[1] == b'\n' {
                    src.advance(2);
                    return Ok(Some(StompItem::Heartbeat));
                }
            }
            Some(_) => {}
        }

        let raw = match parse_frame_slice(&src[..]).map_err(CodecError::Malformed)? {
            Some(raw) => raw,
            None => {
                if src.len() > self.max_frame_size {
                    return Err(CodecError::Malformed(format!(
                        "frame exceeds {} bytes",
                        self.max_frame_size
                    )));
                }
                return Ok(None);
            }
        };
        src.advance(raw.consumed);

        let command_text = String::from_utf8(raw.command)
            .map_err(|e| CodecError::Malformed(format!("invalid utf8 in command: {}", e)))?;
        let command: Command = command_text
            .parse()
            .map_err(|e| CodecError::Malformed(format!("{}", e)))?;

        let escaped = command.escapes_headers();
        let mut frame = Frame::new(command);
        for (k, v) in raw.headers {
            let key = header_text(k, escaped, "key")?;
            let value = header_text(v, escaped, "value")?;
            frame = frame.header(key, value);
        }
        Ok(Some(StompItem::Frame(frame.set_body(raw.body))))
    }
}

impl Encoder<StompItem> for StompCodec {
    type Error = CodecError;

    /// Encode a `StompItem` into the provided destination buffer.
    ///
    /// Headers are written in order and exactly as given. A
    /// `content-length` header is appended only when the frame has none and
    /// the body contains NUL or is not valid UTF-8.
    fn encode(&mut self, item: StompItem, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            StompItem::Heartbeat => {
                dst.put_u8(b'\n');
            }
            StompItem::Frame(frame) => {
                let (command, mut headers, body) = frame.into_parts();
                dst.extend_from_slice(command.as_str().as_bytes());
                dst.put_u8(b'\n');

                let has_cl = headers
                    .iter()
                    .any(|(k, _)| k.eq_ignore_ascii_case("content-length"));
                if !has_cl && (body.contains(&0) || std::str::from_utf8(&body).is_err()) {
                    headers.push(("content-length".to_string(), body.len().to_string()));
                }

                let escape = command.escapes_headers();
                for (k, v) in headers {
                    if escape {
                        dst.extend_from_slice(escape_header_value(&k).as_bytes());
                        dst.put_u8(b':');
                        dst.extend_from_slice(escape_header_value(&v).as_bytes());
                    } else {
                        dst.extend_from_slice(k.as_bytes());
                        dst.put_u8(b':');
                        dst.extend_from_slice(v.as_bytes());
                    }
                    dst.put_u8(b'\n');
                }

                dst.put_u8(b'\n');
                dst.extend_from_slice(&body);
                dst.put_u8(0);
            }
        }

        Ok(())
    }
}
