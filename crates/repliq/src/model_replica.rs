//! Model replicas: application handles over a [`ModelCache`].
//!
//! The cache sits behind a mutex shared with the node actor. Reads lock
//! it, answer from what is cached and may queue requests; the handle then
//! pokes the actor, which drains the cache's outbox onto the connection.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use repliq_model::{CacheConfig, ModelCache, ModelError, ModelEvent, ModelIndex, NodeId};
use repliq_protocol::{ItemFlags, Orientation, Packet, Role, Value};
use repliq_transport::ConnectionId;
use tokio::sync::{broadcast, mpsc, watch};

use crate::actor::Command;
use crate::ReplicaId;

pub(crate) struct ModelShared {
    name: String,
    cache: Mutex<ModelCache>,
    events: broadcast::Sender<ModelEvent>,
    ready: watch::Sender<bool>,
}

impl ModelShared {
    fn new(name: String, config: CacheConfig, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        let (ready, _) = watch::channel(false);
        Self {
            cache: Mutex::new(ModelCache::new(name.clone(), config)),
            name,
            events,
            ready,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Runs `f` against the cache, publishes the events it produced and
    /// returns the packets it queued.
    pub(crate) fn drive(&self, f: impl FnOnce(&mut ModelCache)) -> Vec<Packet> {
        let (events, outbox, ready) = {
            let mut cache = self.cache.lock();
            f(&mut cache);
            (cache.take_events(), cache.take_outbox(), cache.is_ready())
        };
        self.ready.send_if_modified(|current| std::mem::replace(current, ready) != ready);
        for event in events {
            let _ = self.events.send(event);
        }
        outbox
    }
}

/// Actor-side record of a model replica.
pub(crate) struct ModelSlot {
    pub(crate) id: ReplicaId,
    pub(crate) shared: Arc<ModelShared>,
    pub(crate) conn: Option<ConnectionId>,
}

impl ModelSlot {
    pub(crate) fn new(name: String, config: CacheConfig, capacity: usize) -> Self {
        Self {
            id: ReplicaId::next(),
            shared: Arc::new(ModelShared::new(name, config, capacity)),
            conn: None,
        }
    }
}

/// A replicated item model.
///
/// Obtained from [`Node::acquire_model`](crate::Node::acquire_model).
/// Reads never wait: data not yet cached reads as [`Value::Null`] and is
/// fetched in the background, announced by a [`ModelEvent::DataChanged`].
/// Dropping the handle releases the model.
pub struct ModelReplica {
    id: ReplicaId,
    shared: Arc<ModelShared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ModelReplica {
    pub(crate) fn new(id: ReplicaId, shared: Arc<ModelShared>, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { id, shared, commands }
    }

    /// Runs a read against the cache and ships whatever it queued.
    fn read<R>(&self, f: impl FnOnce(&mut ModelCache) -> R) -> R {
        let (result, pending) = {
            let mut cache = self.shared.cache.lock();
            let result = f(&mut cache);
            (result, cache.has_outbox())
        };
        if pending {
            let _ = self.commands.send(Command::ModelRequests { replica: self.id });
        }
        result
    }

    fn peek<R>(&self, f: impl FnOnce(&ModelCache) -> R) -> R {
        f(&self.shared.cache.lock())
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Returns `true` once the model was received from its source.
    pub fn is_ready(&self) -> bool {
        self.peek(ModelCache::is_ready)
    }

    /// Waits until the model is ready.
    pub async fn wait_ready(&self) {
        let mut rx = self.shared.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.shared.events.subscribe()
    }

    pub fn root(&self) -> NodeId {
        self.peek(ModelCache::root)
    }

    pub fn roles(&self) -> Vec<Role> {
        self.peek(|c| c.roles().to_vec())
    }

    pub fn role_names(&self) -> Vec<(Role, String)> {
        self.peek(|c| c.role_names().to_vec())
    }

    /// Number of rows with cached data.
    pub fn cached_rows(&self) -> usize {
        self.peek(ModelCache::cached_rows)
    }

    pub fn index(&self, parent: NodeId, row: u32, column: u32) -> Option<ModelIndex> {
        self.peek(|c| c.index(parent, row, column))
    }

    pub fn data(&self, index: ModelIndex, role: Role) -> Value {
        self.read(|c| c.data(index, role))
    }

    /// Root-level shorthand for [`Self::data`].
    pub fn fetch(&self, row: u32, column: u32, role: Role) -> Value {
        self.read(|c| c.fetch(row, column, role))
    }

    pub fn is_cached(&self, index: ModelIndex, role: Role) -> bool {
        self.peek(|c| c.is_cached(index, role))
    }

    pub fn flags(&self, index: ModelIndex) -> ItemFlags {
        self.read(|c| c.flags(index))
    }

    pub fn row_count(&self, parent: NodeId) -> u32 {
        self.read(|c| c.row_count(parent))
    }

    pub fn column_count(&self, parent: NodeId) -> u32 {
        self.peek(|c| c.column_count(parent))
    }

    pub fn has_children(&self, node: NodeId) -> bool {
        self.peek(|c| c.has_children(node))
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.peek(|c| c.parent(node))
    }

    pub fn row_of(&self, node: NodeId) -> Option<u32> {
        self.peek(|c| c.row_of(node))
    }

    pub fn header_data(&self, section: u32, orientation: Orientation, role: Role) -> Value {
        self.peek(|c| c.header_data(section, orientation, role))
    }

    /// Asks the source to store `value` at `index`.
    pub fn set_data(&self, index: ModelIndex, role: Role, value: Value) -> Result<(), ModelError> {
        self.read(|c| c.set_data(index, role, value))
    }
}

impl Drop for ModelReplica {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::ReleaseModel { replica: self.id });
    }
}

impl fmt::Debug for ModelReplica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelReplica")
            .field("id", &self.id)
            .field("name", &self.shared.name)
            .finish()
    }
}
