//! `Node`: builder and public entry point.
//!
//! A node listens for other nodes, hosts sources and models, and acquires
//! replicas of what other nodes host. All of its state lives in a single
//! actor task (see [`actor`](crate::actor)); `Node` and the handles it hands
//! out are thin senders of commands to it.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use repliq_model::{CacheConfig, ItemModel, ModelSource};
use repliq_protocol::{BinaryCodec, CapabilityMap, Codec, Value};
use repliq_source::{Emitter, PersistedStore, RemoteObject, SourceAdapter, SourceEvent};
use repliq_transport::Endpoint;
use tokio::sync::{mpsc, oneshot};

use crate::actor::{Command, ModelUpdate, NodeActor, NodeShared, SourceUpdate};
use crate::model_replica::{ModelReplica, ModelSlot};
use crate::replica::ReplicaCore;
use crate::{connection, NodeConfig, ReconnectConfig, Registry, Replica, RepliqError};

/// Builder for configuring and starting a [`Node`].
///
/// # Example
///
/// ```rust,no_run
/// use repliq::prelude::*;
///
/// # async fn run() -> Result<(), RepliqError> {
/// let node = Node::builder()
///     .registry_url("tcp://127.0.0.1:5000".parse()?)
///     .build();
/// node.listen("tcp://127.0.0.1:0").await?;
/// # Ok(())
/// # }
/// ```
pub struct NodeBuilder<C: Codec = BinaryCodec> {
    config: NodeConfig,
    codec: C,
}

impl NodeBuilder {
    /// Creates a builder with default settings and the binary codec.
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
            codec: BinaryCodec,
        }
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec> NodeBuilder<C> {
    /// Replaces the whole configuration.
    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets where the registry is hosted.
    pub fn registry_url(mut self, url: Endpoint) -> Self {
        self.config.registry_url = Some(url);
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// Sets the store static replicas persist their values to.
    pub fn persisted_store(mut self, store: Arc<dyn PersistedStore>) -> Self {
        self.config.persisted_store = Some(store);
        self
    }

    /// Switches the wire codec. Every node of a network must use the same.
    pub fn codec<K: Codec>(self, codec: K) -> NodeBuilder<K> {
        NodeBuilder {
            config: self.config,
            codec,
        }
    }

    /// Starts the node.
    ///
    /// Must be called from within a tokio runtime. The node connects to
    /// the registry, if one is configured, right away.
    pub fn build(self) -> Node<C> {
        let config = self.config.validated();
        let codec = Arc::new(self.codec);
        let shared = Arc::new(NodeShared::new(config.channel_capacity));
        if config.registry_url.is_some() {
            shared.registry_enabled.store(true, Ordering::Release);
        }
        let (commands, receiver) = mpsc::unbounded_channel();

        let actor = NodeActor::new(
            config.clone(),
            Arc::clone(&codec),
            commands.clone(),
            receiver,
            Arc::clone(&shared),
        );
        tokio::spawn(actor.run());

        Node {
            inner: Arc::new(NodeInner {
                commands,
                shared,
                codec,
                config,
            }),
        }
    }
}

struct NodeInner<C> {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<NodeShared>,
    codec: Arc<C>,
    config: NodeConfig,
}

impl<C> Drop for NodeInner<C> {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown { done: None });
    }
}

/// A participant in a replication network.
///
/// Cloning is cheap; all clones drive the same node. The node shuts down
/// when the last clone is dropped or [`shutdown`](Self::shutdown) is
/// called. Replicas outlive it but stop receiving updates.
pub struct Node<C: Codec = BinaryCodec> {
    inner: Arc<NodeInner<C>>,
}

impl<C: Codec> Clone for Node<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Node {
    /// Creates a new builder.
    pub fn builder() -> NodeBuilder {
        NodeBuilder::new()
    }

    /// Starts a node with the default configuration.
    pub fn new() -> Self {
        NodeBuilder::new().build()
    }
}

impl Default for Node {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec> Node<C> {
    fn send(&self, cmd: Command) -> Result<(), RepliqError> {
        self.inner.commands.send(cmd).map_err(|_| RepliqError::Shutdown)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, RepliqError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| RepliqError::Shutdown)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Starts accepting nodes on `url` (`tcp://host:port` or
    /// `ws://host:port`; port `0` picks a free one).
    ///
    /// Returns the endpoint actually bound. The first endpoint a node
    /// listens on is the one its sources are announced under.
    pub async fn listen(&self, url: &str) -> Result<Endpoint, RepliqError> {
        let endpoint = Endpoint::parse(url)?;
        let (bound, task) = connection::listen(&endpoint, Arc::clone(&self.inner.codec), self.inner.commands.clone()).await?;
        tracing::info!(endpoint = %bound, "listening");
        self.send(Command::Listening {
            endpoint: bound.clone(),
            task,
        })?;
        Ok(bound)
    }

    /// The endpoint sources are announced under, once listening.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.inner.shared.local.load_full().map(|endpoint| (*endpoint).clone())
    }

    /// Connects to the node at `url` and keeps the connection up.
    ///
    /// Resolves once the first attempt succeeds or fails; after a failure
    /// the node keeps retrying in the background.
    pub async fn connect_to_node(&self, url: &str) -> Result<(), RepliqError> {
        let endpoint = Endpoint::parse(url)?;
        self.request(|reply| Command::Connect { endpoint, reply }).await?
    }

    /// Hosts `object` under `name`.
    ///
    /// Fails if the name is taken on this node or the node is not
    /// listening yet.
    pub async fn enable_remoting<T: RemoteObject>(
        &self,
        name: impl Into<String>,
        object: T,
    ) -> Result<SourceHandle<T>, RepliqError> {
        let adapter = SourceAdapter::new(name, object);
        let name = adapter.name().to_string();
        self.request(|reply| Command::EnableSource { adapter, reply }).await??;
        Ok(SourceHandle {
            name,
            commands: self.inner.commands.clone(),
            _object: PhantomData,
        })
    }

    /// Hosts the item model `model` under `name`.
    pub async fn enable_model_remoting<M: ItemModel>(
        &self,
        name: impl Into<String>,
        model: M,
    ) -> Result<ModelHandle<M>, RepliqError> {
        let source = ModelSource::new(name, model);
        let name = source.name().to_string();
        self.request(|reply| Command::EnableModel { source, reply }).await??;
        Ok(ModelHandle {
            name,
            commands: self.inner.commands.clone(),
            _model: PhantomData,
        })
    }

    /// Acquires a static replica of `name`, typed by `api`.
    ///
    /// The replica starts from persisted values when the node has a store
    /// holding some for this type, and from defaults otherwise.
    pub fn acquire(&self, name: impl Into<String>, api: Arc<CapabilityMap>) -> Replica {
        self.acquire_core(ReplicaCore::new(
            name.into(),
            Some(api),
            self.inner.config.persisted_store.as_deref(),
            self.inner.config.channel_capacity,
        ))
    }

    /// Acquires a dynamic replica of `name`, which takes its type from the
    /// source.
    pub fn acquire_dynamic(&self, name: impl Into<String>) -> Replica {
        self.acquire_core(ReplicaCore::new(name.into(), None, None, self.inner.config.channel_capacity))
    }

    fn acquire_core(&self, core: ReplicaCore) -> Replica {
        let id = core.id();
        let shared = Arc::clone(core.shared());
        // A stopped node leaves the replica `Uninitialized` for good.
        let _ = self.send(Command::Acquire { core });
        Replica::new(id, shared, self.inner.commands.clone())
    }

    /// Acquires a replica of the model hosted as `name`.
    pub fn acquire_model(&self, name: impl Into<String>, config: CacheConfig) -> ModelReplica {
        let slot = ModelSlot::new(name.into(), config.validated(), self.inner.config.channel_capacity);
        let id = slot.id;
        let shared = Arc::clone(&slot.shared);
        let _ = self.send(Command::AcquireModel { slot });
        ModelReplica::new(id, shared, self.inner.commands.clone())
    }

    /// Makes this node the registry host. The node must be listening.
    pub async fn host_registry(&self) -> Result<Registry, RepliqError> {
        self.request(|reply| Command::HostRegistry { reply }).await??;
        Ok(self.registry_handle())
    }

    /// The registry, if this node hosts it or was built with its URL.
    pub fn registry(&self) -> Option<Registry> {
        self.inner
            .shared
            .registry_enabled
            .load(Ordering::Acquire)
            .then(|| self.registry_handle())
    }

    fn registry_handle(&self) -> Registry {
        Registry::new(Arc::clone(&self.inner.shared.registry), self.inner.commands.clone())
    }

    /// Stops the node: listeners close, connections drop and replicas go
    /// `Suspect`.
    pub async fn shutdown(&self) {
        let _ = self.request(|tx| Command::Shutdown { done: Some(tx) }).await;
    }
}

impl<C: Codec> fmt::Debug for Node<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("local", &self.local_endpoint())
            .field("config", &self.inner.config)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SourceHandle
// ---------------------------------------------------------------------------

/// Handle to an object hosted with [`Node::enable_remoting`].
///
/// Changes made through it are forwarded to every replica. Dropping the
/// handle does not stop hosting; call
/// [`disable_remoting`](Self::disable_remoting) for that.
pub struct SourceHandle<T> {
    name: String,
    commands: mpsc::UnboundedSender<Command>,
    _object: PhantomData<fn() -> T>,
}

impl<T: RemoteObject> SourceHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn apply<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut SourceAdapter, oneshot::Sender<Result<R, RepliqError>>) -> Vec<SourceEvent> + Send + 'static,
    ) -> Result<R, RepliqError> {
        let (tx, rx) = oneshot::channel();
        let apply: SourceUpdate = Box::new(move |adapter| f(adapter, tx));
        self.commands
            .send(Command::UpdateSource {
                name: self.name.clone(),
                apply,
            })
            .map_err(|_| RepliqError::Shutdown)?;
        rx.await.map_err(|_| RepliqError::UnknownSource(self.name.clone()))?
    }

    /// Runs `f` against the hosted object. Property changes it makes are
    /// detected and forwarded; signals it emits through the [`Emitter`]
    /// are forwarded after it returns.
    pub async fn update<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut T, &mut Emitter) -> R + Send + 'static,
    ) -> Result<R, RepliqError> {
        let name = self.name.clone();
        self.apply(move |adapter, tx| match adapter.update::<T, R>(f) {
            Some((result, events)) => {
                let _ = tx.send(Ok(result));
                events
            }
            None => {
                let _ = tx.send(Err(RepliqError::WrongType(name)));
                Vec::new()
            }
        })
        .await
    }

    /// Writes property `index` from the hosting side. Any modifier is
    /// writable here.
    pub async fn set_property(&self, index: usize, value: Value) -> Result<(), RepliqError> {
        self.apply(move |adapter, tx| match adapter.set_property(index, value) {
            Ok(events) => {
                let _ = tx.send(Ok(()));
                events
            }
            Err(e) => {
                let _ = tx.send(Err(e.into()));
                Vec::new()
            }
        })
        .await
    }

    /// Emits declared signal `index` to every replica.
    pub async fn emit(&self, index: usize, args: Vec<Value>) -> Result<(), RepliqError> {
        self.apply(move |adapter, tx| {
            let events = adapter.emit(index, args);
            let _ = tx.send(Ok(()));
            events
        })
        .await
    }

    /// Current property values in capability-map order.
    pub async fn snapshot(&self) -> Result<Vec<Value>, RepliqError> {
        self.apply(|adapter, tx| {
            let _ = tx.send(Ok(adapter.snapshot().to_vec()));
            Vec::new()
        })
        .await
    }

    /// Stops hosting the object. Its replicas go `Suspect`.
    pub async fn disable_remoting(self) -> Result<bool, RepliqError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::DisableSource {
                name: self.name.clone(),
                reply: tx,
            })
            .map_err(|_| RepliqError::Shutdown)?;
        rx.await.map_err(|_| RepliqError::Shutdown)
    }
}

impl<T> fmt::Debug for SourceHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceHandle").field("name", &self.name).finish()
    }
}

// ---------------------------------------------------------------------------
// ModelHandle
// ---------------------------------------------------------------------------

/// Handle to a model hosted with [`Node::enable_model_remoting`].
pub struct ModelHandle<M> {
    name: String,
    commands: mpsc::UnboundedSender<Command>,
    _model: PhantomData<fn() -> M>,
}

impl<M: ItemModel> ModelHandle<M> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `f` against the hosted model and forwards the changes it
    /// recorded to every model replica.
    pub async fn update<R: Send + 'static>(&self, f: impl FnOnce(&mut M) -> R + Send + 'static) -> Result<R, RepliqError> {
        let (tx, rx) = oneshot::channel();
        let name = self.name.clone();
        let apply: ModelUpdate = Box::new(move |source| match source.update::<M, R>(f) {
            Some((result, packets)) => {
                let _ = tx.send(Ok(result));
                packets
            }
            None => {
                let _ = tx.send(Err(RepliqError::WrongType(name)));
                Vec::new()
            }
        });
        self.commands
            .send(Command::UpdateModel {
                name: self.name.clone(),
                apply,
            })
            .map_err(|_| RepliqError::Shutdown)?;
        rx.await.map_err(|_| RepliqError::UnknownSource(self.name.clone()))?
    }

    /// Stops hosting the model.
    pub async fn disable(self) -> Result<bool, RepliqError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::DisableModel {
                name: self.name.clone(),
                reply: tx,
            })
            .map_err(|_| RepliqError::Shutdown)?;
        rx.await.map_err(|_| RepliqError::Shutdown)
    }
}

impl<M> fmt::Debug for ModelHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle").field("name", &self.name).finish()
    }
}
