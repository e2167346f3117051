//! Relay wire codec
//!
//! Every connection starts in line mode: the server writes `accepted`, the
//! peer answers with one JSON request terminated by `\n`. Stream traffic then
//! switches the decoder to chunk mode:
//!
//! ```text
//! +--------+--------+--------+--------+----...----+
//! |   length (u32 big-endian)         |  payload  |
//! +--------+--------+--------+--------+----...----+
//! ```
//!
//! A zero-length chunk marks the end of a stream. The payload is never
//! interpreted by the relay.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default maximum length of a request line (64 KiB)
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// Default maximum size of a single stream chunk (8 MiB)
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Size of the chunk length prefix
pub const CHUNK_LENGTH_SIZE: usize = 4;

/// What the decoder currently expects from the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecMode {
    /// Newline-terminated text (handshake, signals, results)
    Lines,
    /// Length-prefixed binary chunks (stream payload)
    Chunks,
}

/// A decoded or to-be-encoded unit on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// One text line without its terminator
    Line(String),
    /// One opaque payload chunk; empty means end of stream
    Chunk(Bytes),
}

/// tokio-util codec for relay connections
#[derive(Debug, Clone)]
pub struct RelayCodec {
    mode: CodecMode,
    max_line_length: usize,
    max_chunk_size: usize,
    /// Where to resume the newline search on the next decode call
    next_index: usize,
}

impl RelayCodec {
    /// Create a codec in line mode with default limits
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_LINE_LENGTH, DEFAULT_MAX_CHUNK_SIZE)
    }

    /// Create a codec in line mode with custom limits
    pub fn with_limits(max_line_length: usize, max_chunk_size: usize) -> Self {
        Self {
            mode: CodecMode::Lines,
            max_line_length,
            max_chunk_size,
            next_index: 0,
        }
    }

    /// Current decode mode
    pub fn mode(&self) -> CodecMode {
        self.mode
    }

    /// Switch the decode mode
    ///
    /// Bytes already buffered are decoded under the new mode.
    pub fn set_mode(&mut self, mode: CodecMode) {
        self.mode = mode;
        self.next_index = 0;
    }

    pub fn max_line_length(&self) -> usize {
        self.max_line_length
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    fn decode_line(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        let newline = src[self.next_index..].iter().position(|b| *b == b'\n');

        match newline {
            Some(offset) => {
                let end = self.next_index + offset;
                self.next_index = 0;

                if end > self.max_line_length {
                    return Err(line_too_long(end, self.max_line_length));
                }

                let line = src.split_to(end + 1);
                let line = &line[..end];
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                Ok(Some(Frame::Line(utf8(line)?)))
            }
            None => {
                if src.len() > self.max_line_length {
                    return Err(line_too_long(src.len(), self.max_line_length));
                }
                self.next_index = src.len();
                Ok(None)
            }
        }
    }

    fn decode_chunk(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        if src.len() < CHUNK_LENGTH_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > self.max_chunk_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "chunk too large: {} bytes (max {} bytes)",
                    length, self.max_chunk_size
                ),
            ));
        }

        let total = CHUNK_LENGTH_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(CHUNK_LENGTH_SIZE);
        Ok(Some(Frame::Chunk(src.split_to(length).freeze())))
    }
}

impl Default for RelayCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RelayCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.mode {
            CodecMode::Lines => self.decode_line(src),
            CodecMode::Chunks => self.decode_chunk(src),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }

        match self.mode {
            // Last line without a terminator
            CodecMode::Lines => {
                self.next_index = 0;
                let rest = src.split_to(src.len());
                let rest = rest.strip_suffix(b"\r").unwrap_or(&rest[..]);
                Ok(Some(Frame::Line(utf8(rest)?)))
            }
            CodecMode::Chunks => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended inside a chunk ({} bytes buffered)", src.len()),
            )),
        }
    }
}

impl Encoder<Frame> for RelayCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match frame {
            Frame::Line(line) => {
                if line.contains('\n') {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "line frames must not contain a newline",
                    ));
                }
                dst.reserve(line.len() + 1);
                dst.put_slice(line.as_bytes());
                dst.put_u8(b'\n');
            }
            Frame::Chunk(data) => {
                if data.len() > self.max_chunk_size {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!(
                            "chunk too large: {} bytes (max {} bytes)",
                            data.len(),
                            self.max_chunk_size
                        ),
                    ));
                }
                dst.reserve(CHUNK_LENGTH_SIZE + data.len());
                dst.put_u32(data.len() as u32);
                dst.put_slice(&data);
            }
        }
        Ok(())
    }
}

fn utf8(bytes: &[u8]) -> Result<String, io::Error> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn line_too_long(length: usize, max: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("line too long: {} bytes (max {} bytes)", length, max),
    )
}
