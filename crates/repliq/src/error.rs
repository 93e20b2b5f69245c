//! Error types for the node layer.
//!
//! [`RepliqError`] wraps every sub-crate error so callers of the `repliq`
//! meta-crate deal with a single type. Failures of remote method calls
//! travel separately as [`CallError`] through
//! [`PendingCall`](crate::PendingCall), and refused replica-side writes as
//! [`ReplicaError`].

use repliq_model::ModelError;
use repliq_protocol::{ProtocolError, ValueType};
use repliq_source::SourceError;
use repliq_transport::TransportError;

use crate::ReplicaState;

/// Top-level error that wraps all crate-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum RepliqError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Model(#[from] ModelError),

    /// Sources can only be enabled on a node that listens somewhere.
    #[error("node is not listening; call `listen` before enabling remoting")]
    NotListening,

    /// A local object or model already uses this name.
    #[error("name `{0}` is already hosted on this node")]
    DuplicateName(String),

    /// No hosted object or model has this name.
    #[error("no hosted source named `{0}`")]
    UnknownSource(String),

    /// The hosted object is not of the type the caller asked for.
    #[error("source `{0}` has a different concrete type")]
    WrongType(String),

    /// The node has shut down.
    #[error("node has shut down")]
    Shutdown,
}

/// Why a remote method call did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// The link to the source dropped before the reply arrived.
    #[error("connection to the source was lost")]
    ConnectionLost,

    /// The caller cancelled the call.
    #[error("call was cancelled")]
    Cancelled,

    /// The replica was released while the call was outstanding.
    #[error("replica was released")]
    Released,

    /// The replica was not `Valid` when the call was made.
    #[error("replica is {0}, not valid")]
    NotValid(ReplicaState),

    #[error("no method at index {0}")]
    UnknownMethod(usize),

    /// The source ran the call and reported a failure.
    #[error("remote call failed: {0}")]
    Remote(String),
}

/// Why a replica refused a property write.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicaError {
    #[error("replica type does not match its source")]
    SignatureMismatch,

    #[error("replica is {0}, not valid")]
    NotValid(ReplicaState),

    #[error("no property at index {0}")]
    UnknownProperty(usize),

    #[error("property `{0}` cannot be written by replicas")]
    NotWritable(String),

    #[error("property expects {expected}")]
    TypeMismatch { expected: ValueType },

    /// The node has shut down.
    #[error("node has shut down")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ConnectionClosed("gone".into());
        let repliq_err: RepliqError = err.into();
        assert!(matches!(repliq_err, RepliqError::Transport(_)));
        assert!(repliq_err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_protocol_error() {
        let err = ProtocolError::InvalidMessage("bad".into());
        let repliq_err: RepliqError = err.into();
        assert!(matches!(repliq_err, RepliqError::Protocol(_)));
    }

    #[test]
    fn test_from_source_error() {
        let err = SourceError::UnknownMethod(3);
        let repliq_err: RepliqError = err.into();
        assert!(matches!(repliq_err, RepliqError::Source(_)));
    }

    #[test]
    fn test_call_error_mentions_state() {
        let err = CallError::NotValid(ReplicaState::Suspect);
        assert_eq!(err.to_string(), "replica is suspect, not valid");
    }
}
