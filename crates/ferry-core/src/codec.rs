//! Newline-delimited JSON codec.
//!
//! Each message is one UTF-8 JSON document terminated by `\n`. Incoming
//! bytes arrive in arbitrary chunks, so [`LineDecoder`] buffers partial
//! lines until their newline shows up.

use crate::config::CodecConfig;
use crate::connection::ByteStream;
use crate::protocol::{Message, ProtocolError};
use crate::Result;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};

/// Splits a byte stream into lines.
#[derive(Debug)]
pub struct LineDecoder {
    buffer: BytesMut,
    /// Bytes at the front of `buffer` already known to hold no newline.
    scanned: usize,
    max_line_length: usize,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new(CodecConfig::MAX_LINE_LENGTH)
    }
}

impl LineDecoder {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(CodecConfig::INITIAL_BUFFER_CAPACITY),
            scanned: 0,
            max_line_length,
        }
    }

    /// Append a chunk read from the connection.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete, non-empty line, without its terminator.
    ///
    /// Returns `Ok(None)` when only a partial line is buffered. A partial
    /// line that outgrows the limit is discarded and reported once.
    pub fn next_line(&mut self) -> std::result::Result<Option<Bytes>, ProtocolError> {
        loop {
            let newline = self.buffer[self.scanned..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.scanned + offset);
            match newline {
                Some(index) => {
                    self.scanned = 0;
                    let mut line = self.buffer.split_to(index + 1);
                    line.truncate(index);
                    if line.last() == Some(&b'\r') {
                        line.truncate(index - 1);
                    }
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    return Ok(Some(line.freeze()));
                }
                None if self.buffer.len() > self.max_line_length => {
                    self.buffer.clear();
                    self.scanned = 0;
                    return Err(ProtocolError::LineTooLong {
                        limit: self.max_line_length,
                    });
                }
                None => {
                    self.scanned = self.buffer.len();
                    return Ok(None);
                }
            }
        }
    }

    /// Whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<Bytes> {
        self.scanned = 0;
        let rest = self.buffer.split().freeze();
        if rest.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            Some(rest)
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Parse one line into a message.
pub fn decode_line(line: &[u8]) -> std::result::Result<Message, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_slice(line).map_err(|e| ProtocolError::Parse {
            message: e.to_string(),
        })?;
    Message::from_value(value)
}

/// Serialize a message and append the line terminator.
pub fn encode_message(message: &Message) -> Result<Bytes> {
    let mut encoded = serde_json::to_vec(message)?;
    encoded.push(b'\n');
    Ok(Bytes::from(encoded))
}

/// An item produced by [`decode_stream`].
#[derive(Debug)]
pub enum Decoded {
    Message(Message),
    Invalid(ProtocolError),
    /// The byte stream failed; no further items follow.
    Failed(std::io::Error),
}

struct DecodeState {
    readable: ByteStream,
    decoder: LineDecoder,
    done: bool,
}

/// Turn a connection's byte stream into a stream of decoded messages.
///
/// Protocol violations are yielded in place so the caller can report them
/// and keep reading; the stream ends with the byte stream.
pub fn decode_stream(readable: ByteStream) -> impl Stream<Item = Decoded> + Send {
    let state = DecodeState {
        readable,
        decoder: LineDecoder::default(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            match state.decoder.next_line() {
                Ok(Some(line)) => return Some((decoded(&line), state)),
                Err(err) => return Some((Decoded::Invalid(err), state)),
                Ok(None) if state.done => return None,
                Ok(None) => {}
            }

            match state.readable.next().await {
                Some(Ok(chunk)) => state.decoder.extend(&chunk),
                Some(Err(err)) => {
                    state.done = true;
                    state.decoder.finish();
                    return Some((Decoded::Failed(err), state));
                }
                None => {
                    state.done = true;
                    if let Some(rest) = state.decoder.finish() {
                        return Some((decoded(&rest), state));
                    }
                    return None;
                }
            }
        }
    })
}

fn decoded(line: &[u8]) -> Decoded {
    match decode_line(line) {
        Ok(message) => Decoded::Message(message),
        Err(err) => Decoded::Invalid(err),
    }
}
