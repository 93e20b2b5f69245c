//! Error types for the model layer.

use repliq_protocol::{IndexPath, Role};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// The index does not name an item the replica knows about.
    #[error("no item at {0}")]
    InvalidIndex(IndexPath),

    /// The item's flags do not include `EDITABLE`.
    #[error("item at {0} is not editable")]
    NotEditable(IndexPath),

    /// The model refused the value.
    #[error("model rejected {role} at {index}")]
    Rejected { index: IndexPath, role: Role },

    /// The replica has not received the model yet.
    #[error("model `{0}` is not initialized")]
    NotReady(String),
}
