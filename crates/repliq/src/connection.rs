//! Connection tasks.
//!
//! Every connection, accepted or dialed, gets two tasks. The writer drains
//! an unbounded frame channel owned by the node actor and closes the
//! connection once the actor drops its end. The reader decodes packets and
//! forwards them to the actor until the peer goes away or the actor tells
//! it to stop.
//!
//! The reader announces the connection with [`Command::Attach`] before its
//! first [`Command::Incoming`], so the actor never sees a packet from a
//! connection it does not know.

use std::sync::Arc;

use repliq_protocol::{Codec, Packet};
use repliq_transport::{Connection, Endpoint, Scheme, TcpConnection, TcpTransport, Transport, TransportError};
#[cfg(feature = "websocket")]
use repliq_transport::{WebSocketConnection, WebSocketTransport};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::actor::Command;

/// Binds a listener for `endpoint` and spawns its accept loop.
///
/// Returns the endpoint actually bound (with the real port when `0` was
/// asked for) and the accept task.
pub(crate) async fn listen<K: Codec>(
    endpoint: &Endpoint,
    codec: Arc<K>,
    commands: mpsc::UnboundedSender<Command>,
) -> Result<(Endpoint, JoinHandle<()>), TransportError> {
    match endpoint.scheme() {
        Scheme::Tcp => {
            let transport = TcpTransport::bind(&endpoint.authority()).await?;
            let bound = local_endpoint(endpoint, &transport)?;
            Ok((bound, tokio::spawn(accept_loop(transport, codec, commands))))
        }
        #[cfg(feature = "websocket")]
        Scheme::WebSocket => {
            let transport = WebSocketTransport::bind(&endpoint.authority()).await?;
            let bound = local_endpoint(endpoint, &transport)?;
            Ok((bound, tokio::spawn(accept_loop(transport, codec, commands))))
        }
        #[cfg(not(feature = "websocket"))]
        Scheme::WebSocket => Err(TransportError::UnsupportedScheme(endpoint.to_string())),
    }
}

fn local_endpoint<T: Transport>(requested: &Endpoint, transport: &T) -> Result<Endpoint, TransportError> {
    let addr = transport.local_addr().map_err(TransportError::AcceptFailed)?;
    Ok(requested.with_port(addr.port()))
}

async fn accept_loop<T, K>(mut transport: T, codec: Arc<K>, commands: mpsc::UnboundedSender<Command>)
where
    T: Transport,
    K: Codec,
{
    loop {
        match transport.accept().await {
            Ok(conn) => attach(conn, None, Arc::clone(&codec), commands.clone()),
            Err(e) => {
                tracing::error!(error = %e, "accept failed");
                if commands.is_closed() {
                    break;
                }
            }
        }
    }
}

/// Connects to `endpoint` and attaches the connection as an outbound link.
pub(crate) async fn dial<K: Codec>(
    endpoint: &Endpoint,
    codec: Arc<K>,
    commands: mpsc::UnboundedSender<Command>,
) -> Result<(), TransportError> {
    let link = Some(endpoint.clone());
    match endpoint.scheme() {
        Scheme::Tcp => {
            let conn = TcpConnection::connect(endpoint).await?;
            attach(conn, link, codec, commands);
        }
        #[cfg(feature = "websocket")]
        Scheme::WebSocket => {
            let conn = WebSocketConnection::connect(endpoint).await?;
            attach(conn, link, codec, commands);
        }
        #[cfg(not(feature = "websocket"))]
        Scheme::WebSocket => return Err(TransportError::UnsupportedScheme(endpoint.to_string())),
    }
    Ok(())
}

/// Spawns the reader and writer tasks of `conn`.
pub(crate) fn attach<C, K>(
    conn: C,
    link: Option<Endpoint>,
    codec: Arc<K>,
    commands: mpsc::UnboundedSender<Command>,
) where
    C: Connection,
    K: Codec,
{
    let conn = Arc::new(conn);
    let id = conn.id();
    let (writer, mut frames) = mpsc::unbounded_channel::<Vec<u8>>();
    let (stop, mut stopped) = oneshot::channel::<()>();

    tracing::debug!(%id, peer = ?conn.peer_addr(), outbound = link.is_some(), "connection attached");
    if commands
        .send(Command::Attach {
            conn: id,
            link,
            writer,
            stop,
        })
        .is_err()
    {
        return;
    }

    let out = Arc::clone(&conn);
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if let Err(e) = out.send(&frame).await {
                tracing::debug!(%id, error = %e, "send failed");
                break;
            }
        }
        let _ = out.close().await;
    });

    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = &mut stopped => break,
                received = conn.recv() => received,
            };
            let data = match received {
                Ok(Some(data)) => data,
                Ok(None) => {
                    tracing::debug!(%id, "connection closed by peer");
                    break;
                }
                Err(e) => {
                    tracing::debug!(%id, error = %e, "receive failed");
                    break;
                }
            };
            let packet: Packet = match codec.decode(&data) {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::debug!(%id, error = %e, "failed to decode packet");
                    continue;
                }
            };
            if commands.send(Command::Incoming { conn: id, packet }).is_err() {
                break;
            }
        }
        let _ = commands.send(Command::Closed { conn: id });
    });
}
