//! Raw TCP transport: each frame is a 4-byte big-endian length followed by
//! the payload (`tokio-util`'s `LengthDelimitedCodec`).

use std::net::SocketAddr;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::{next_connection_id, Connection, ConnectionId, Endpoint, Transport, TransportError};

/// Largest frame accepted from a peer. A larger length prefix means the
/// stream is corrupt and the connection is dropped.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// A [`Transport`] listening for `tcp://` peers.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Binds a listener to `addr` (`host:port`; port `0` picks a free one).
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::info!(addr, "TCP transport listening");
        Ok(Self { listener })
    }
}

impl Transport for TcpTransport {
    type Connection = TcpConnection;
    type Error = TransportError;

    async fn accept(&mut self) -> Result<Self::Connection, Self::Error> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;
        let _ = stream.set_nodelay(true);
        let conn = FramedConnection::new(stream, Some(addr));
        tracing::debug!(id = %conn.id(), %addr, "accepted TCP connection");
        Ok(conn)
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    async fn shutdown(&self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// A length-delimited frame connection over any byte stream.
///
/// Generic so tests can run it over `tokio::io::duplex`.
pub struct FramedConnection<S> {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    reader: Mutex<FramedRead<ReadHalf<S>, LengthDelimitedCodec>>,
    writer: Mutex<FramedWrite<WriteHalf<S>, LengthDelimitedCodec>>,
}

/// A framed connection over a TCP stream.
pub type TcpConnection = FramedConnection<TcpStream>;

impl<S> FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wraps a byte stream, splitting it into independent halves.
    pub fn new(stream: S, peer: Option<SocketAddr>) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            id: next_connection_id(),
            peer,
            reader: Mutex::new(FramedRead::new(read, codec())),
            writer: Mutex::new(FramedWrite::new(write, codec())),
        }
    }
}

impl TcpConnection {
    /// Opens an outbound connection to a `tcp://` endpoint.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(endpoint.authority())
            .await
            .map_err(|source| TransportError::ConnectFailed {
                endpoint: endpoint.to_string(),
                source,
            })?;
        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr().ok();
        let conn = Self::new(stream, peer);
        tracing::debug!(id = %conn.id(), %endpoint, "connected TCP");
        Ok(conn)
    }
}

impl<S> Connection for FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Sync + 'static,
{
    type Error = TransportError;

    async fn send(&self, data: &[u8]) -> Result<(), Self::Error> {
        self.writer
            .lock()
            .await
            .send(Bytes::copy_from_slice(data))
            .await
            .map_err(TransportError::SendFailed)
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        match self.reader.lock().await.next().await {
            Some(Ok(frame)) => Ok(Some(frame.to_vec())),
            Some(Err(e)) => Err(TransportError::ReceiveFailed(e)),
            None => Ok(None),
        }
    }

    async fn close(&self) -> Result<(), Self::Error> {
        SinkExt::<Bytes>::close(&mut *self.writer.lock().await)
            .await
            .map_err(TransportError::SendFailed)
    }

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}
