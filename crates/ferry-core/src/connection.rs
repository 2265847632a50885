//! Duplex byte-stream connections.
//!
//! A [`Connection`] owns a readable stream of byte chunks, a writable byte
//! sink and a closed signal. The signal lives in a cloneable
//! [`ConnectionHandle`] so that whoever holds the connection's halves and
//! whoever wants to shut it down can be different tasks.

use crate::config::TransportConfig;
use bytes::{Bytes, BytesMut};
use futures::sink::{self, Sink};
use futures::stream::{self, BoxStream, StreamExt};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

/// Readable side of a connection.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Writable side of a connection.
pub type ByteSink = Pin<Box<dyn Sink<Bytes, Error = io::Error> + Send>>;

/// Descriptive details about a connection, used for logging and events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub transport: &'static str,
    pub peer: Option<String>,
}

impl ConnectionInfo {
    pub fn new(transport: &'static str, peer: Option<String>) -> Self {
        Self { transport, peer }
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.peer {
            Some(peer) => write!(f, "{}://{}", self.transport, peer),
            None => write!(f, "{}", self.transport),
        }
    }
}

/// Close control and closed notification for one connection.
///
/// The closed state flips at most once no matter how many clones call
/// [`close`](ConnectionHandle::close) or in which order the local side and
/// the peer give up.
#[derive(Clone)]
pub struct ConnectionHandle {
    closed: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            closed: Arc::new(closed),
        }
    }

    /// Mark the connection closed.
    ///
    /// Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolve once the connection has closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives in `self`, so waiting cannot fail.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Receiver that observes the single open -> closed transition.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

impl Default for ConnectionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A duplex byte stream with a closable lifecycle.
pub struct Connection {
    readable: ByteStream,
    writable: ByteSink,
    handle: ConnectionHandle,
    info: ConnectionInfo,
}

impl Connection {
    pub fn new(readable: ByteStream, writable: ByteSink, info: ConnectionInfo) -> Self {
        Self {
            readable,
            writable,
            handle: ConnectionHandle::new(),
            info,
        }
    }

    /// Wrap any async reader/writer pair.
    pub fn from_io<R, W>(reader: R, writer: W, info: ConnectionInfo) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(reader_stream(reader), writer_sink(writer), info)
    }

    /// Wrap an established TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok().map(|addr| addr.to_string());
        let (reader, writer) = stream.into_split();
        Self::from_io(reader, writer, ConnectionInfo::new("tcp", peer))
    }

    /// Two in-memory connections wired to each other.
    pub fn pair() -> (Connection, Connection) {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let (left_reader, left_writer) = tokio::io::split(left);
        let (right_reader, right_writer) = tokio::io::split(right);
        (
            Self::from_io(left_reader, left_writer, ConnectionInfo::new("memory", None)),
            Self::from_io(
                right_reader,
                right_writer,
                ConnectionInfo::new("memory", None),
            ),
        )
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Close the connection; idempotent.
    pub fn close(&self) -> bool {
        self.handle.close()
    }

    pub fn into_parts(self) -> (ByteStream, ByteSink, ConnectionHandle) {
        (self.readable, self.writable, self.handle)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("info", &self.info)
            .field("handle", &self.handle)
            .finish()
    }
}

/// Read chunks until EOF; an error ends the stream after being yielded.
fn reader_stream<R>(reader: R) -> ByteStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    stream::unfold(Some(reader), |state| async move {
        let mut reader = state?;
        let mut buf = BytesMut::with_capacity(TransportConfig::READ_CHUNK_SIZE);
        match reader.read_buf(&mut buf).await {
            Ok(0) => None,
            Ok(_) => Some((Ok(buf.freeze()), Some(reader))),
            Err(err) => Some((Err(err), None)),
        }
    })
    .boxed()
}

/// Write and flush each chunk. Dropping the sink drops the writer, which for
/// TCP shuts down the write direction.
fn writer_sink<W>(writer: W) -> ByteSink
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    Box::pin(sink::unfold(writer, |mut writer, chunk: Bytes| async move {
        writer.write_all(&chunk).await?;
        writer.flush().await?;
        Ok::<_, io::Error>(writer)
    }))
}
