//! Replicated item models.
//!
//! A model source hosts an [`ItemModel`] (a tree of rows, each with a
//! fixed set of columns and per-role values). A model replica mirrors it
//! through a [`ModelCache`]:
//!
//! - **Shape first**: the replica learns row and column counts up front
//!   and discovers deeper levels on demand.
//! - **Data on demand**: role values are fetched when read, coalesced into
//!   range requests and kept in a bounded LRU.
//! - **Stable identities**: every row the replica knows has a [`NodeId`]
//!   that survives insertions and removals around it.
//!
//! Both halves are sans-IO; the node moves their packets.

mod cache;
mod config;
mod error;
mod item_model;
mod source;
mod standard;
mod tree;

pub use cache::{ModelCache, ModelEvent, ModelIndex};
pub use config::{CacheConfig, InitialAction, ROOT_CACHE_SIZE_ENV};
pub use error::ModelError;
pub use item_model::{default_role_names, ItemModel, ModelChange};
pub use source::{model_signature, ModelSource, MODEL_TYPE_NAME};
pub use standard::StandardModel;
pub use tree::{NodeId, NodeTree};
