//! Error types for the source layer.

use repliq_protocol::{Value, ValueType};

/// Reasons a source refuses a request.
///
/// Errors caused by a remote replica are logged and, for method calls,
/// returned to the caller as the text of the failed reply.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SourceError {
    #[error("no property at index {0}")]
    UnknownProperty(usize),

    #[error("no method at index {0}")]
    UnknownMethod(usize),

    /// Only `ReadWrite` properties accept writes from replicas.
    #[error("property `{0}` is not writable by replicas")]
    NotWritable(String),

    #[error("`{name}` expects {expected} argument(s), got {got}")]
    ArgumentCount {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("expected {expected}, got {} ({got})", got.kind())]
    TypeMismatch { expected: ValueType, got: Value },

    /// The object itself rejected the request.
    #[error("{0}")]
    Rejected(String),
}
