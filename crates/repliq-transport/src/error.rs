/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection was closed.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Sending data failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Receiving data failed. Framing errors (oversized or truncated
    /// frames) land here too and end the connection.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// Binding or accepting connections failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// Opening an outbound connection failed.
    #[error("connect to {endpoint} failed: {source}")]
    ConnectFailed {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// The endpoint URL could not be parsed or lacks a host/port.
    #[error("invalid endpoint {0:?}: {1}")]
    InvalidEndpoint(String, String),

    /// The endpoint uses a scheme no transport understands.
    #[error("unsupported endpoint scheme {0:?}")]
    UnsupportedScheme(String),

    /// The transport was shut down.
    #[error("transport shut down")]
    Shutdown,
}
