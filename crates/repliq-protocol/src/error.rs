//! Error types for the protocol layer.

/// Errors raised while encoding, decoding or validating packets.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The JSON codec failed to encode or decode.
    #[cfg(feature = "json")]
    #[error("json codec: {0}")]
    Json(#[from] serde_json::Error),

    /// The binary codec failed to encode or decode.
    #[cfg(feature = "binary")]
    #[error("binary codec: {0}")]
    Binary(#[from] bincode::Error),

    /// The packet decoded but breaks a protocol rule (e.g. an object
    /// packet arriving before `Hello`).
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The peer speaks a different protocol version.
    #[error("protocol version mismatch: ours {ours}, peer {theirs}")]
    VersionMismatch { ours: u32, theirs: u32 },
}
