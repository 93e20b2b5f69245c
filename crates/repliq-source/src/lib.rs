//! The source side of repliq: hosting objects for remote replicas.
//!
//! This crate turns a concrete object into something the node can serve:
//!
//! 1. **Description**: a type implements [`RemoteObject`], which exposes
//!    its [`CapabilityMap`](repliq_protocol::CapabilityMap) and index-based
//!    property and method access.
//! 2. **Adaptation**: [`SourceAdapter`] wraps any `RemoteObject`, enforces
//!    property modifiers and argument types, and turns incoming packets
//!    into replies and change notifications.
//! 3. **Persistence**: [`PersistedStore`] keeps last-known property values
//!    for replicas across restarts.
//!
//! # How it fits in the stack
//!
//! ```text
//! Node (above)      ← routes packets for a name to its adapter
//!     ↕
//! Source (this crate) ← capability-checked dispatch, change detection
//!     ↕
//! Protocol (below)  ← Value, CapabilityMap, Packet
//! ```

mod adapter;
mod error;
mod object;
mod persist;

pub use adapter::{Dispatch, SourceAdapter};
pub use error::SourceError;
pub use object::{Emitter, RemoteObject, SourceEvent};
pub use persist::{MemoryStore, PersistedStore};
