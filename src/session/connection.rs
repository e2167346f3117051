//! Connection handle
//!
//! A `Connection` wraps one accepted socket (or any async byte pipe) framed
//! with [`RelayCodec`]. Handles move between owners: the dispatcher hands a
//! viewer's connection to a stream channel, a producer's connection to the
//! channel's source slot, a client's connection to its delivery session.
//! Whoever currently owns a handle is the one that closes it.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::error::{Error, ProtocolError, Result};
use crate::protocol::codec::{CodecMode, Frame, RelayCodec};
use crate::protocol::message::Message;

/// Byte transport a connection can run over
pub trait Transport: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a connection
///
/// Two connections from the same peer never compare equal; removal from a
/// consumer list goes by this id, never by peer or content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Framed connection handle
pub struct Connection {
    id: ConnectionId,
    peer: String,
    framed: Framed<Box<dyn Transport>, RelayCodec>,
    closed: bool,
}

impl Connection {
    /// Wrap a transport with the default codec limits
    pub fn new<T: Transport>(io: T, peer: impl Into<String>) -> Self {
        Self::with_codec(io, peer, RelayCodec::new())
    }

    /// Wrap a transport with a preconfigured codec
    pub fn with_codec<T: Transport>(io: T, peer: impl Into<String>, codec: RelayCodec) -> Self {
        let io: Box<dyn Transport> = Box::new(io);
        Self {
            id: ConnectionId::next(),
            peer: peer.into(),
            framed: Framed::new(io, codec),
            closed: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Peer label (address or test name)
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn mode(&self) -> CodecMode {
        self.framed.codec().mode()
    }

    /// Switch how incoming bytes are decoded
    pub fn set_mode(&mut self, mode: CodecMode) {
        self.framed.codec_mut().set_mode(mode);
    }

    /// Read one text line; `None` when the peer closed the connection
    pub async fn recv_line(&mut self) -> Result<Option<String>> {
        match self.framed.next().await {
            Some(Ok(Frame::Line(line))) => Ok(Some(line)),
            Some(Ok(Frame::Chunk(_))) => Err(Error::Protocol(ProtocolError::UnexpectedFrame(
                "expected a line, got a chunk",
            ))),
            Some(Err(e)) => Err(Error::Io(e)),
            None => Ok(None),
        }
    }

    /// Read and parse one request line
    pub async fn recv_message(&mut self) -> Result<Option<Message>> {
        match self.recv_line().await? {
            Some(line) => Message::parse(&line).map(Some),
            None => Ok(None),
        }
    }

    /// Write one text line
    pub async fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.framed.send(Frame::Line(line.to_owned())).await
    }

    /// Write one message as a JSON line
    pub async fn send_message(&mut self, message: &Message) -> Result<()> {
        let line = message.to_line()?;
        self.send_line(&line).await?;
        Ok(())
    }

    /// Read the next payload chunk
    ///
    /// Returns `None` when the producer is gone: end of file or an explicit
    /// zero-length chunk.
    pub async fn read_chunk(&mut self) -> io::Result<Option<Bytes>> {
        match self.framed.next().await {
            Some(Ok(Frame::Chunk(chunk))) if chunk.is_empty() => Ok(None),
            Some(Ok(Frame::Chunk(chunk))) => Ok(Some(chunk)),
            Some(Ok(Frame::Line(_))) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "expected a chunk, got a line",
            )),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Write one payload chunk
    pub async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        self.framed.send(Frame::Chunk(chunk)).await
    }

    /// Flush and shut down the write side
    ///
    /// Safe to call more than once; only the first call touches the socket.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(e) = SinkExt::<Frame>::close(&mut self.framed).await {
            tracing::debug!(
                connection = %self.id,
                peer = %self.peer,
                error = %e,
                "Error while closing connection"
            );
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("mode", &self.mode())
            .field("closed", &self.closed)
            .finish()
    }
}
