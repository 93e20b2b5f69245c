//! # Repliq
//!
//! Live replication of objects and item models between processes.
//!
//! A process hosts an object as a *source* on a [`Node`]; other nodes
//! acquire *replicas* of it. A replica mirrors the source's properties,
//! receives its signals and forwards method calls and writes back to it.
//! Item models replicate lazily through a bounded cache that keeps the
//! tree's structure while evicting row data.
//!
//! Nodes find sources through a [`Registry`]: one node hosts it and every
//! node configured with its URL announces what it hosts and learns where
//! everything else lives.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use repliq::prelude::*;
//!
//! # async fn run() -> Result<(), RepliqError> {
//! let host = Node::new();
//! host.listen("tcp://127.0.0.1:5000").await?;
//! host.host_registry().await?;
//!
//! let client = Node::builder()
//!     .registry_url("tcp://127.0.0.1:5000".parse()?)
//!     .build();
//! let counter = client.acquire_dynamic("Counter");
//! if counter.wait_for_source().await == ReplicaState::Valid {
//!     println!("count = {:?}", counter.property_by_name("count"));
//! }
//! # Ok(())
//! # }
//! ```

mod actor;
mod config;
mod connection;
mod error;
pub mod logging;
mod model_replica;
mod node;
mod pending;
mod registry;
mod replica;

pub use config::{NodeConfig, ReconnectConfig};
pub use error::{CallError, ReplicaError, RepliqError};
pub use model_replica::ModelReplica;
pub use node::{ModelHandle, Node, NodeBuilder, SourceHandle};
pub use pending::PendingCall;
pub use registry::{registry_capabilities, Registry, RegistryEvent, REGISTRY_NAME};
pub use replica::{Replica, ReplicaEvent, ReplicaId, ReplicaState};

pub use repliq_model::{
    CacheConfig, InitialAction, ItemModel, ModelChange, ModelError, ModelEvent, ModelIndex, NodeId,
    StandardModel,
};
pub use repliq_protocol::{
    CapabilityMap, IndexPath, ItemFlags, ObjectSignature, Orientation, PropertyModifier, Role, SourceLocation,
    Value, ValueType,
};
pub use repliq_source::{Emitter, MemoryStore, PersistedStore, RemoteObject};
pub use repliq_transport::Endpoint;

/// Convenience re-exports for building nodes, sources and replicas.
pub mod prelude {
    pub use crate::{
        CacheConfig, CallError, CapabilityMap, Emitter, Endpoint, ItemModel, ModelEvent, ModelIndex,
        ModelReplica, Node, NodeConfig, PendingCall, PropertyModifier, Registry, RegistryEvent, RemoteObject,
        Replica, ReplicaError, ReplicaEvent, ReplicaState, RepliqError, Role, StandardModel, Value, ValueType,
    };
}
