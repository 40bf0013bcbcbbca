//! One TCP connection carrying length-delimited JSON messages.
//!
//! `Connection<In, Out>` reads `In` messages and writes `Out` messages. The orchestrator
//! side is a [`ServerConnection`] (reads responses), the agent side a [`ClientConnection`]
//! (reads requests).

use std::io;
use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::bytes::Buf;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::JsonCodec;
use super::protocol::{Request, Response};

pub type FrameReader<T> = FramedRead<OwnedReadHalf, JsonCodec<T>>;
pub type FrameWriter<T> = FramedWrite<OwnedWriteHalf, JsonCodec<T>>;

/// Orchestrator end: sends requests, receives responses.
pub type ServerConnection = Connection<Response, Request>;
/// Agent end: sends responses, receives requests.
pub type ClientConnection = Connection<Request, Response>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect to {addr} after {attempts} attempts: {source}")]
    Connect {
        addr: SocketAddr,
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("connection unusable after an earlier protocol error")]
    Broken,
    #[error("unexpected message: expected {expected}, got {got}")]
    Unexpected { expected: &'static str, got: String },
}

impl TransportError {
    /// Map a codec/socket error onto the transport taxonomy.
    pub fn from_io(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::ConnectionClosed,
            io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => {
                Self::Protocol(ProtocolError::InvalidFrame(e.to_string()))
            }
            _ => Self::Io(e),
        }
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}

pub struct Connection<In, Out> {
    reader: FrameReader<In>,
    writer: ConnectionWriter<Out>,
    broken: bool,
}

impl<In, Out> Connection<In, Out>
where
    In: DeserializeOwned,
    Out: Serialize,
{
    /// Wrap an established stream. Disables Nagle's algorithm.
    pub fn new(stream: TcpStream, max_frame_length: usize) -> Result<Self, TransportError> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: FramedRead::new(read_half, JsonCodec::with_max_frame_length(max_frame_length)),
            writer: ConnectionWriter {
                inner: FramedWrite::new(
                    write_half,
                    JsonCodec::with_max_frame_length(max_frame_length),
                ),
                peer,
            },
            broken: false,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.writer.peer
    }

    pub async fn send_message(&mut self, msg: Out) -> Result<(), TransportError> {
        self.writer.send_message(msg).await
    }

    pub async fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.writer.send_bytes(bytes).await
    }

    /// Receive one framed message.
    ///
    /// A decode failure leaves the stream at an unknown offset, so every later
    /// receive fails with [`ProtocolError::Broken`].
    pub async fn receive_message(&mut self) -> Result<In, TransportError> {
        if self.broken {
            return Err(ProtocolError::Broken.into());
        }
        match self.reader.next().await {
            Some(Ok(msg)) => Ok(msg),
            Some(Err(e)) => {
                let err = TransportError::from_io(e);
                if err.is_protocol() {
                    self.broken = true;
                }
                Err(err)
            }
            None => Err(TransportError::ConnectionClosed),
        }
    }

    /// Fill `buf` completely with raw bytes, consuming anything already buffered first.
    pub async fn receive_bytes(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let buffered = self.reader.read_buffer_mut();
        let n = buffered.len().min(buf.len());
        buf[..n].copy_from_slice(&buffered[..n]);
        buffered.advance(n);

        if n < buf.len() {
            self.reader
                .get_mut()
                .read_exact(&mut buf[n..])
                .await
                .map_err(TransportError::from_io)?;
        }
        Ok(())
    }

    /// Discard any bytes that are buffered or immediately readable, without blocking.
    ///
    /// Returns how many bytes were thrown away.
    pub fn drain(&mut self) -> usize {
        let buffered = self.reader.read_buffer_mut();
        let mut discarded = buffered.len();
        buffered.clear();

        let mut scratch = [0u8; 4096];
        loop {
            match self.reader.get_ref().try_read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => discarded += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::debug!(error = %e, "Drain stopped on socket error");
                    break;
                }
            }
        }
        if discarded > 0 {
            tracing::debug!(peer = %self.peer(), discarded, "Drained unconsumed bytes");
        }
        discarded
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.writer.close().await
    }

    /// Split into the framed read half and the writer.
    pub fn into_split(self) -> (FrameReader<In>, ConnectionWriter<Out>) {
        (self.reader, self.writer)
    }
}

/// Write half of a [`Connection`].
pub struct ConnectionWriter<Out> {
    inner: FrameWriter<Out>,
    peer: SocketAddr,
}

impl<Out: Serialize> ConnectionWriter<Out> {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Length prefix and payload are encoded into one buffer and flushed together.
    pub async fn send_message(&mut self, msg: Out) -> Result<(), TransportError> {
        self.inner.send(msg).await.map_err(TransportError::from_io)
    }

    pub async fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let stream = self.inner.get_mut();
        stream
            .write_all(bytes)
            .await
            .map_err(TransportError::from_io)?;
        stream.flush().await.map_err(TransportError::from_io)
    }

    /// Shut down the write direction; the peer observes end-of-stream.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await.map_err(TransportError::from_io)
    }
}
