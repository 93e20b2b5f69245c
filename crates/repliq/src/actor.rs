//! The node actor: the single task that owns a node's state.
//!
//! Connections, hosted sources and models, replicas and the registry role
//! all live here. Everything else (connection tasks, handles, the public
//! [`Node`](crate::Node)) talks to the actor through [`Command`]s, so no
//! state is shared mutably across tasks apart from the replica caches the
//! handles read.
//!
//! Packets produced while handling a command are queued in `outgoing` and
//! written out once the command is done.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use repliq_model::{ModelSource, MODEL_TYPE_NAME};
use repliq_protocol::{Codec, ObjectInfo, Packet, SourceLocation, Value, PROTOCOL_VERSION};
use repliq_source::{Emitter, SourceAdapter, SourceEvent};
use repliq_transport::{ConnectionId, Endpoint, TransportError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::connection;
use crate::model_replica::ModelSlot;
use crate::registry::{
    parse_table, registry_capabilities, RegistryClient, RegistryObject, RegistryShared, ADDED_SIGNAL,
    LOCATIONS_PROPERTY, REGISTRY_NAME, REMOVED_SIGNAL,
};
use crate::replica::{ReplicaCore, ReplicaEvent};
use crate::{CallError, NodeConfig, RepliqError, ReplicaId, ReplicaState};

/// A mutation of a hosted object, run inside the actor.
pub(crate) type SourceUpdate = Box<dyn FnOnce(&mut SourceAdapter) -> Vec<SourceEvent> + Send>;

/// A mutation of a hosted model, run inside the actor.
pub(crate) type ModelUpdate = Box<dyn FnOnce(&mut ModelSource) -> Vec<Packet> + Send>;

type Reply<T> = oneshot::Sender<T>;

/// Commands sent to the node actor.
pub(crate) enum Command {
    // -- Connections --
    /// A connection task started. Always precedes its first `Incoming`.
    Attach {
        conn: ConnectionId,
        /// Set for connections this node dialed.
        link: Option<Endpoint>,
        writer: mpsc::UnboundedSender<Vec<u8>>,
        stop: oneshot::Sender<()>,
    },
    Incoming {
        conn: ConnectionId,
        packet: Packet,
    },
    Closed {
        conn: ConnectionId,
    },
    Listening {
        endpoint: Endpoint,
        task: JoinHandle<()>,
    },
    Connect {
        endpoint: Endpoint,
        reply: Reply<Result<(), RepliqError>>,
    },
    DialFailed {
        endpoint: Endpoint,
        error: TransportError,
    },
    Redial {
        endpoint: Endpoint,
    },

    // -- Hosting --
    EnableSource {
        adapter: SourceAdapter,
        reply: Reply<Result<(), RepliqError>>,
    },
    DisableSource {
        name: String,
        reply: Reply<bool>,
    },
    UpdateSource {
        name: String,
        apply: SourceUpdate,
    },
    EnableModel {
        source: ModelSource,
        reply: Reply<Result<(), RepliqError>>,
    },
    DisableModel {
        name: String,
        reply: Reply<bool>,
    },
    UpdateModel {
        name: String,
        apply: ModelUpdate,
    },

    // -- Replicas --
    Acquire {
        core: ReplicaCore,
    },
    ReleaseReplica {
        replica: ReplicaId,
    },
    /// A packet from a replica that needs no reply.
    ReplicaSend {
        replica: ReplicaId,
        packet: Packet,
    },
    Call {
        replica: ReplicaId,
        call_id: u64,
        packet: Packet,
        reply: Reply<Result<Value, CallError>>,
    },
    CancelCall {
        replica: ReplicaId,
        call_id: u64,
    },
    AcquireModel {
        slot: ModelSlot,
    },
    /// A model replica queued requests.
    ModelRequests {
        replica: ReplicaId,
    },
    ReleaseModel {
        replica: ReplicaId,
    },

    // -- Registry --
    HostRegistry {
        reply: Reply<Result<(), RepliqError>>,
    },
    RegistryAdd {
        location: SourceLocation,
        reply: Reply<bool>,
    },
    RegistryRemove {
        name: String,
        reply: Reply<bool>,
    },

    Shutdown {
        done: Option<Reply<()>>,
    },
}

/// State the actor shares with node handles.
pub(crate) struct NodeShared {
    /// First endpoint the node listens on.
    pub(crate) local: ArcSwapOption<Endpoint>,
    pub(crate) registry: Arc<RegistryShared>,
    /// The node hosts the registry or was configured with its URL.
    pub(crate) registry_enabled: AtomicBool,
}

impl NodeShared {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            local: ArcSwapOption::empty(),
            registry: Arc::new(RegistryShared::new(capacity)),
            registry_enabled: AtomicBool::new(false),
        }
    }
}

struct Peer {
    writer: mpsc::UnboundedSender<Vec<u8>>,
    /// Dropping it stops the connection's reader.
    _stop: oneshot::Sender<()>,
    /// What the peer hosts; `None` until its `Hello`.
    objects: Option<Vec<ObjectInfo>>,
    link: Option<Endpoint>,
}

impl Peer {
    fn lists(&self, name: &str, model: bool) -> bool {
        self.objects.as_ref().is_some_and(|objects| {
            objects
                .iter()
                .any(|o| o.name == name && (o.type_name == MODEL_TYPE_NAME) == model)
        })
    }
}

/// An outbound connection the node keeps alive.
struct Link {
    conn: Option<ConnectionId>,
    /// Consecutive failed attempts.
    attempt: u32,
    waiter: Option<Reply<Result<(), RepliqError>>>,
}

struct HostedSource {
    adapter: SourceAdapter,
    subscribers: HashSet<ConnectionId>,
}

struct HostedModel {
    source: ModelSource,
    subscribers: HashSet<ConnectionId>,
}

enum RegistryRole {
    None,
    Host,
    Client {
        client: RegistryClient,
        replica: ReplicaId,
    },
}

fn fan_out(outgoing: &mut Vec<(ConnectionId, Packet)>, subscribers: &HashSet<ConnectionId>, packets: Vec<Packet>) {
    for packet in packets {
        for conn in subscribers {
            outgoing.push((*conn, packet.clone()));
        }
    }
}

pub(crate) struct NodeActor<K: Codec> {
    config: NodeConfig,
    codec: Arc<K>,
    commands: mpsc::UnboundedSender<Command>,
    receiver: mpsc::UnboundedReceiver<Command>,
    shared: Arc<NodeShared>,
    locals: Vec<Endpoint>,
    listeners: Vec<JoinHandle<()>>,
    peers: HashMap<ConnectionId, Peer>,
    links: HashMap<Endpoint, Link>,
    sources: BTreeMap<String, HostedSource>,
    models: BTreeMap<String, HostedModel>,
    replicas: HashMap<ReplicaId, ReplicaCore>,
    model_replicas: HashMap<ReplicaId, ModelSlot>,
    registry: RegistryRole,
    outgoing: Vec<(ConnectionId, Packet)>,
}

impl<K: Codec> NodeActor<K> {
    pub(crate) fn new(
        config: NodeConfig,
        codec: Arc<K>,
        commands: mpsc::UnboundedSender<Command>,
        receiver: mpsc::UnboundedReceiver<Command>,
        shared: Arc<NodeShared>,
    ) -> Self {
        Self {
            config,
            codec,
            commands,
            receiver,
            shared,
            locals: Vec::new(),
            listeners: Vec::new(),
            peers: HashMap::new(),
            links: HashMap::new(),
            sources: BTreeMap::new(),
            models: BTreeMap::new(),
            replicas: HashMap::new(),
            model_replicas: HashMap::new(),
            registry: RegistryRole::None,
            outgoing: Vec::new(),
        }
    }

    /// Runs the actor loop until shutdown.
    pub(crate) async fn run(mut self) {
        tracing::info!("node started");
        if let Some(url) = self.config.registry_url.clone() {
            self.start_registry_client(url);
        }

        let mut done = None;
        while let Some(cmd) = self.receiver.recv().await {
            if let Command::Shutdown { done: reply } = cmd {
                done = reply;
                break;
            }
            self.handle(cmd);
            self.flush();
        }

        self.stop();
        tracing::info!("node stopped");
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Attach {
                conn,
                link,
                writer,
                stop,
            } => self.on_attach(conn, link, writer, stop),
            Command::Incoming { conn, packet } => {
                if self.peers.contains_key(&conn) {
                    self.route(conn, packet);
                }
            }
            Command::Closed { conn } => self.on_closed(conn),
            Command::Listening { endpoint, task } => self.on_listening(endpoint, task),
            Command::Connect { endpoint, reply } => self.ensure_link(endpoint, Some(reply)),
            Command::DialFailed { endpoint, error } => self.on_dial_failed(endpoint, error),
            Command::Redial { endpoint } => {
                if self.links.get(&endpoint).is_some_and(|l| l.conn.is_none()) {
                    self.spawn_dial(endpoint);
                }
            }

            Command::EnableSource { adapter, reply } => {
                let _ = reply.send(self.enable_source(adapter));
            }
            Command::DisableSource { name, reply } => {
                let _ = reply.send(self.disable_source(&name));
            }
            Command::UpdateSource { name, apply } => {
                if let Some(hosted) = self.sources.get_mut(&name) {
                    let events = apply(&mut hosted.adapter);
                    let packets = hosted.adapter.packets(&events);
                    fan_out(&mut self.outgoing, &hosted.subscribers, packets);
                }
            }
            Command::EnableModel { source, reply } => {
                let _ = reply.send(self.enable_model(source));
            }
            Command::DisableModel { name, reply } => {
                let _ = reply.send(self.disable_model(&name));
            }
            Command::UpdateModel { name, apply } => {
                if let Some(hosted) = self.models.get_mut(&name) {
                    let packets = apply(&mut hosted.source);
                    fan_out(&mut self.outgoing, &hosted.subscribers, packets);
                }
            }

            Command::Acquire { core } => {
                tracing::debug!(replica = %core.id(), name = core.name(), "replica acquired");
                self.replicas.insert(core.id(), core);
                self.bind_unbound();
            }
            Command::ReleaseReplica { replica } => self.release_replica(replica),
            Command::ReplicaSend { replica, packet } => {
                match self.replicas.get(&replica).and_then(ReplicaCore::conn) {
                    Some(conn) => self.outgoing.push((conn, packet)),
                    None => tracing::debug!(%replica, kind = packet.kind(), "replica not connected; dropping"),
                }
            }
            Command::Call {
                replica,
                call_id,
                packet,
                reply,
            } => match self.replicas.get_mut(&replica) {
                Some(core) => {
                    if core.register_call(call_id, reply)
                        && let Some(conn) = core.conn()
                    {
                        self.outgoing.push((conn, packet));
                    }
                }
                None => {
                    let _ = reply.send(Err(CallError::Released));
                }
            },
            Command::CancelCall { replica, call_id } => {
                if let Some(core) = self.replicas.get_mut(&replica) {
                    core.cancel_call(call_id);
                }
            }
            Command::AcquireModel { slot } => {
                tracing::debug!(replica = %slot.id, name = slot.shared.name(), "model replica acquired");
                self.model_replicas.insert(slot.id, slot);
                self.bind_unbound();
            }
            Command::ModelRequests { replica } => {
                if let Some(slot) = self.model_replicas.get(&replica)
                    && let Some(conn) = slot.conn
                {
                    for packet in slot.shared.drive(|_| {}) {
                        self.outgoing.push((conn, packet));
                    }
                }
            }
            Command::ReleaseModel { replica } => self.release_model(replica),

            Command::HostRegistry { reply } => {
                let _ = reply.send(self.host_registry());
            }
            Command::RegistryAdd { location, reply } => {
                let _ = reply.send(self.registry_add(location));
            }
            Command::RegistryRemove { name, reply } => {
                let _ = reply.send(self.registry_remove(&name));
            }

            // Handled by `run`.
            Command::Shutdown { .. } => {}
        }
    }

    /// Encodes and hands queued packets to their connections' writers.
    fn flush(&mut self) {
        for (conn, packet) in std::mem::take(&mut self.outgoing) {
            let Some(peer) = self.peers.get(&conn) else {
                continue;
            };
            match self.codec.encode(&packet) {
                Ok(frame) => {
                    let _ = peer.writer.send(frame);
                }
                Err(e) => tracing::error!(%conn, kind = packet.kind(), error = %e, "failed to encode packet"),
            }
        }
    }

    fn stop(&mut self) {
        for task in self.listeners.drain(..) {
            task.abort();
        }
        self.peers.clear();
        self.links.clear();
        for core in self.replicas.values_mut() {
            core.link_lost();
        }
        for slot in self.model_replicas.values() {
            slot.shared.drive(|cache| cache.disconnect());
        }
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    fn is_local(&self, endpoint: &Endpoint) -> bool {
        self.locals.contains(endpoint)
    }

    fn object_list(&self) -> Vec<ObjectInfo> {
        self.sources
            .values()
            .map(|hosted| hosted.adapter.info())
            .chain(self.models.values().map(|hosted| hosted.source.info()))
            .collect()
    }

    fn broadcast_object_list(&mut self) {
        let objects = self.object_list();
        for conn in self.peers.keys() {
            self.outgoing.push((
                *conn,
                Packet::ObjectList {
                    objects: objects.clone(),
                },
            ));
        }
    }

    fn on_attach(
        &mut self,
        conn: ConnectionId,
        link: Option<Endpoint>,
        writer: mpsc::UnboundedSender<Vec<u8>>,
        stop: oneshot::Sender<()>,
    ) {
        if let Some(endpoint) = &link {
            let Some(state) = self.links.get_mut(endpoint) else {
                tracing::debug!(%conn, %endpoint, "link no longer wanted; closing");
                return;
            };
            state.conn = Some(conn);
            state.attempt = 0;
            if let Some(waiter) = state.waiter.take() {
                let _ = waiter.send(Ok(()));
            }
            tracing::info!(%conn, %endpoint, "connected to node");
        } else {
            tracing::info!(%conn, "node connected");
        }
        self.peers.insert(
            conn,
            Peer {
                writer,
                _stop: stop,
                objects: None,
                link,
            },
        );
        self.outgoing.push((
            conn,
            Packet::Hello {
                version: PROTOCOL_VERSION,
                objects: self.object_list(),
            },
        ));
    }

    fn on_closed(&mut self, conn: ConnectionId) {
        let Some(peer) = self.peers.remove(&conn) else {
            return;
        };
        tracing::info!(%conn, "connection closed");

        for hosted in self.sources.values_mut() {
            hosted.subscribers.remove(&conn);
        }
        for hosted in self.models.values_mut() {
            hosted.subscribers.remove(&conn);
        }

        let lost: Vec<ReplicaId> = self
            .replicas
            .iter()
            .filter(|(_, core)| core.conn() == Some(conn))
            .map(|(id, _)| *id)
            .collect();
        for id in lost {
            self.replica_lost(id);
        }
        for slot in self.model_replicas.values_mut() {
            if slot.conn == Some(conn) {
                slot.conn = None;
                slot.shared.drive(|cache| cache.disconnect());
            }
        }

        if matches!(self.registry, RegistryRole::Host) {
            self.host_update(|reg, signals| reg.remove_owned_by(conn, signals));
        }

        if let Some(endpoint) = peer.link
            && let Some(link) = self.links.get_mut(&endpoint)
            && link.conn == Some(conn)
        {
            link.conn = None;
            self.schedule_redial(endpoint);
        }
        self.bind_unbound();
    }

    fn on_listening(&mut self, endpoint: Endpoint, task: JoinHandle<()>) {
        self.listeners.push(task);
        if self.shared.local.load().is_none() {
            self.shared.local.store(Some(Arc::new(endpoint.clone())));
        }
        // Never keep a link to ourselves.
        if let Some(link) = self.links.remove(&endpoint) {
            if let Some(conn) = link.conn {
                self.on_closed(conn);
            }
            if let Some(waiter) = link.waiter {
                let _ = waiter.send(Ok(()));
            }
        }
        self.locals.push(endpoint);
    }

    fn ensure_link(&mut self, endpoint: Endpoint, waiter: Option<Reply<Result<(), RepliqError>>>) {
        if self.is_local(&endpoint) {
            if let Some(waiter) = waiter {
                let _ = waiter.send(Ok(()));
            }
            return;
        }
        if let Some(link) = self.links.get_mut(&endpoint) {
            match waiter {
                Some(waiter) if link.conn.is_none() && link.waiter.is_none() => link.waiter = Some(waiter),
                Some(waiter) => {
                    let _ = waiter.send(Ok(()));
                }
                None => {}
            }
            return;
        }
        tracing::info!(%endpoint, "connecting to node");
        self.links.insert(
            endpoint.clone(),
            Link {
                conn: None,
                attempt: 0,
                waiter,
            },
        );
        self.spawn_dial(endpoint);
    }

    fn spawn_dial(&self, endpoint: Endpoint) {
        let codec = Arc::clone(&self.codec);
        let commands = self.commands.clone();
        tokio::spawn(async move {
            if let Err(error) = connection::dial(&endpoint, codec, commands.clone()).await {
                let _ = commands.send(Command::DialFailed { endpoint, error });
            }
        });
    }

    fn on_dial_failed(&mut self, endpoint: Endpoint, error: TransportError) {
        let Some(link) = self.links.get_mut(&endpoint) else {
            return;
        };
        if link.attempt == 0 {
            tracing::warn!(%endpoint, %error, "connection failed; retrying");
        } else {
            tracing::debug!(%endpoint, %error, attempt = link.attempt, "connection failed");
        }
        if let Some(waiter) = link.waiter.take() {
            let _ = waiter.send(Err(error.into()));
        }
        self.schedule_redial(endpoint);
    }

    fn schedule_redial(&mut self, endpoint: Endpoint) {
        let Some(link) = self.links.get_mut(&endpoint) else {
            return;
        };
        let delay = self.config.reconnect.delay(link.attempt);
        link.attempt = link.attempt.saturating_add(1);
        let commands = self.commands.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(Command::Redial { endpoint });
        });
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    fn route(&mut self, conn: ConnectionId, packet: Packet) {
        match packet {
            Packet::Hello { version, objects } => {
                if version != PROTOCOL_VERSION {
                    tracing::warn!(%conn, version, expected = PROTOCOL_VERSION, "protocol version mismatch; dropping peer");
                    self.on_closed(conn);
                    return;
                }
                self.on_object_list(conn, objects);
            }
            Packet::ObjectList { objects } => self.on_object_list(conn, objects),

            Packet::Handshake { .. } | Packet::SetProperty { .. } | Packet::Invoke { .. } => {
                self.on_source_request(conn, packet);
            }
            Packet::Release { name } => {
                if let Some(hosted) = self.sources.get_mut(&name) {
                    hosted.subscribers.remove(&conn);
                } else if let Some(hosted) = self.models.get_mut(&name) {
                    hosted.subscribers.remove(&conn);
                }
            }

            Packet::AddSource { location } => {
                if !matches!(self.registry, RegistryRole::Host) {
                    tracing::warn!(%conn, %location, "AddSource sent to a node that does not host the registry");
                    return;
                }
                self.host_update(|reg, signals| reg.add(location, Some(conn), signals));
            }
            Packet::RemoveSource { location } => {
                if matches!(self.registry, RegistryRole::Host) {
                    self.host_update(|reg, signals| reg.remove(&location, signals));
                }
            }

            Packet::AcquireModel { .. }
            | Packet::DataRequest { .. }
            | Packet::SizeRequest { .. }
            | Packet::SetData { .. } => self.on_model_request(conn, packet),

            Packet::InitReply { .. }
            | Packet::SignatureMismatch { .. }
            | Packet::PropertyChanged { .. }
            | Packet::Signal { .. }
            | Packet::InvokeReply { .. } => self.on_replica_packet(conn, packet),

            Packet::ModelInit { .. }
            | Packet::RowsInserted { .. }
            | Packet::RowsRemoved { .. }
            | Packet::ColumnsInserted { .. }
            | Packet::ColumnsRemoved { .. }
            | Packet::ModelReset { .. }
            | Packet::DataChanged { .. }
            | Packet::DataReply { .. }
            | Packet::SizeReply { .. } => self.on_model_packet(conn, packet),
        }
    }

    fn on_object_list(&mut self, conn: ConnectionId, objects: Vec<ObjectInfo>) {
        let Some(peer) = self.peers.get_mut(&conn) else {
            return;
        };
        tracing::debug!(%conn, count = objects.len(), "peer object list");
        let names: HashSet<String> = objects.iter().map(|o| o.name.clone()).collect();
        peer.objects = Some(objects);

        let vanished: Vec<ReplicaId> = self
            .replicas
            .iter()
            .filter(|(_, core)| core.conn() == Some(conn) && !names.contains(core.name()))
            .map(|(id, _)| *id)
            .collect();
        for id in vanished {
            tracing::info!(%conn, replica = %id, "source withdrawn");
            self.replica_lost(id);
        }
        for slot in self.model_replicas.values_mut() {
            if slot.conn == Some(conn) && !names.contains(slot.shared.name()) {
                slot.conn = None;
                slot.shared.drive(|cache| cache.disconnect());
            }
        }
        self.bind_unbound();
    }

    fn on_source_request(&mut self, conn: ConnectionId, packet: Packet) {
        let Some(name) = packet.object_name().map(str::to_owned) else {
            return;
        };
        let Some(hosted) = self.sources.get_mut(&name) else {
            tracing::debug!(%conn, name, kind = packet.kind(), "request for unknown source");
            // Calls still get an answer so the caller does not wait forever.
            if let Packet::Invoke {
                call_id: Some(call_id),
                ..
            } = packet
            {
                self.outgoing.push((
                    conn,
                    Packet::InvokeReply {
                        result: Err(format!("no source named `{name}`")),
                        name,
                        call_id,
                    },
                ));
            }
            return;
        };

        let dispatch = hosted.adapter.dispatch(packet);
        if let Some(reply) = dispatch.reply {
            if matches!(reply, Packet::InitReply { .. }) && hosted.subscribers.insert(conn) {
                tracing::debug!(%conn, name, "replica subscribed");
            }
            self.outgoing.push((conn, reply));
        }
        fan_out(&mut self.outgoing, &hosted.subscribers, dispatch.broadcast);
    }

    fn on_model_request(&mut self, conn: ConnectionId, packet: Packet) {
        let Some(name) = packet.object_name().map(str::to_owned) else {
            return;
        };
        let Some(hosted) = self.models.get_mut(&name) else {
            tracing::debug!(%conn, name, kind = packet.kind(), "request for unknown model");
            return;
        };
        if matches!(packet, Packet::AcquireModel { .. }) {
            hosted.subscribers.insert(conn);
        }
        let dispatch = hosted.source.dispatch(packet);
        if let Some(reply) = dispatch.reply {
            self.outgoing.push((conn, reply));
        }
        fan_out(&mut self.outgoing, &hosted.subscribers, dispatch.broadcast);
    }

    fn on_replica_packet(&mut self, conn: ConnectionId, packet: Packet) {
        let Some(name) = packet.object_name() else {
            return;
        };
        let targets: Vec<ReplicaId> = self
            .replicas
            .iter()
            .filter(|(_, core)| core.conn() == Some(conn) && core.name() == name)
            .filter(|(_, core)| match &packet {
                Packet::InvokeReply { call_id, .. } => core.has_call(*call_id),
                _ => true,
            })
            .map(|(id, _)| *id)
            .collect();
        if targets.is_empty() {
            tracing::debug!(%conn, name, kind = packet.kind(), "no replica for packet");
            return;
        }
        for id in targets {
            let Some(core) = self.replicas.get_mut(&id) else {
                continue;
            };
            let events = core.handle(packet.clone());
            self.after_replica_events(id, events);
        }
    }

    fn on_model_packet(&mut self, conn: ConnectionId, packet: Packet) {
        let Some(name) = packet.object_name() else {
            return;
        };
        for slot in self.model_replicas.values() {
            if slot.conn != Some(conn) || slot.shared.name() != name {
                continue;
            }
            for request in slot.shared.drive(|cache| cache.handle(packet.clone())) {
                self.outgoing.push((conn, request));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Replicas
    // -----------------------------------------------------------------------

    fn find_peer(&self, name: &str, model: bool) -> Option<ConnectionId> {
        self.peers
            .iter()
            .filter(|(_, peer)| peer.lists(name, model))
            .map(|(id, _)| *id)
            .min()
    }

    /// Binds every replica without a source to a peer that hosts it, and
    /// dials the registry's endpoint for the ones no peer hosts.
    fn bind_unbound(&mut self) {
        let mut wanted = Vec::new();

        let unbound: Vec<(ReplicaId, String)> = self
            .replicas
            .iter()
            .filter(|(_, core)| core.is_unbound())
            .map(|(id, core)| (*id, core.name().to_string()))
            .collect();
        for (id, name) in unbound {
            let Some(conn) = self.find_peer(&name, false) else {
                wanted.push(name);
                continue;
            };
            let Some(core) = self.replicas.get_mut(&id) else {
                continue;
            };
            let (handshake, events) = core.bind(conn);
            self.outgoing.push((conn, handshake));
            self.after_replica_events(id, events);
        }

        let unbound_models: Vec<(ReplicaId, String)> = self
            .model_replicas
            .values()
            .filter(|slot| slot.conn.is_none())
            .map(|slot| (slot.id, slot.shared.name().to_string()))
            .collect();
        for (id, name) in unbound_models {
            let Some(conn) = self.find_peer(&name, true) else {
                wanted.push(name);
                continue;
            };
            let Some(slot) = self.model_replicas.get_mut(&id) else {
                continue;
            };
            slot.conn = Some(conn);
            for request in slot.shared.drive(|cache| cache.acquire()) {
                self.outgoing.push((conn, request));
            }
        }

        for name in wanted {
            if let Some(endpoint) = self.shared.registry.resolve(&name)
                && !self.is_local(&endpoint)
            {
                self.ensure_link(endpoint, None);
            }
        }
    }

    fn replica_lost(&mut self, id: ReplicaId) {
        if let Some(core) = self.replicas.get_mut(&id) {
            let events = core.link_lost();
            self.after_replica_events(id, events);
        }
    }

    fn release_replica(&mut self, replica: ReplicaId) {
        let Some(core) = self.replicas.remove(&replica) else {
            return;
        };
        let name = core.name().to_string();
        let conn = core.conn();
        core.release(self.config.persisted_store.as_deref());
        tracing::debug!(%replica, name, "replica released");
        if let Some(conn) = conn
            && !self
                .replicas
                .values()
                .any(|other| other.conn() == Some(conn) && other.name() == name)
        {
            self.outgoing.push((conn, Packet::Release { name }));
        }
    }

    fn release_model(&mut self, replica: ReplicaId) {
        let Some(slot) = self.model_replicas.remove(&replica) else {
            return;
        };
        let name = slot.shared.name().to_string();
        tracing::debug!(%replica, name, "model replica released");
        if let Some(conn) = slot.conn
            && !self
                .model_replicas
                .values()
                .any(|other| other.conn == Some(conn) && other.shared.name() == name)
        {
            self.outgoing.push((conn, Packet::Release { name }));
        }
    }

    /// Feeds the registry replica's events to the registry client.
    fn after_replica_events(&mut self, id: ReplicaId, events: Vec<ReplicaEvent>) {
        let RegistryRole::Client { client, replica } = &mut self.registry else {
            return;
        };
        if *replica != id || events.is_empty() {
            return;
        }
        let core = self.replicas.get(&id);
        let conn = core.and_then(ReplicaCore::conn);

        let mut table_changed = false;
        for event in events {
            match event {
                ReplicaEvent::Initialized => {
                    if let Some(value) = core.and_then(|c| c.shared().value(LOCATIONS_PROPERTY)) {
                        client.on_table(&value);
                        table_changed = true;
                    }
                }
                ReplicaEvent::PropertyChanged {
                    index: LOCATIONS_PROPERTY,
                    value,
                } => {
                    client.on_table(&value);
                    table_changed = true;
                }
                ReplicaEvent::Signal { index, args } if index == ADDED_SIGNAL => {
                    client.on_added(&args);
                    table_changed = true;
                }
                ReplicaEvent::Signal { index, args } if index == REMOVED_SIGNAL => {
                    client.on_removed(&args);
                    table_changed = true;
                }
                ReplicaEvent::StateChanged {
                    new: ReplicaState::Valid,
                    ..
                } => {
                    if let Some(conn) = conn {
                        for packet in client.on_valid() {
                            self.outgoing.push((conn, packet));
                        }
                    }
                }
                ReplicaEvent::StateChanged {
                    new: ReplicaState::Suspect | ReplicaState::SignatureMismatch,
                    ..
                } => client.on_link_lost(),
                _ => {}
            }
        }

        if table_changed {
            self.shared.registry.publish(client.table());
            self.bind_unbound();
        }
    }

    // -----------------------------------------------------------------------
    // Hosting
    // -----------------------------------------------------------------------

    fn check_name(&self, name: &str) -> Result<Endpoint, RepliqError> {
        if self.sources.contains_key(name) || self.models.contains_key(name) {
            return Err(RepliqError::DuplicateName(name.to_string()));
        }
        self.locals.first().cloned().ok_or(RepliqError::NotListening)
    }

    fn enable_source(&mut self, adapter: SourceAdapter) -> Result<(), RepliqError> {
        let name = adapter.name().to_string();
        let local = self.check_name(&name)?;
        tracing::info!(name, type_name = adapter.api().type_name(), "source enabled");
        self.sources.insert(
            name.clone(),
            HostedSource {
                adapter,
                subscribers: HashSet::new(),
            },
        );
        self.broadcast_object_list();
        self.registry_add(SourceLocation::new(name, local));
        Ok(())
    }

    fn disable_source(&mut self, name: &str) -> bool {
        if name == REGISTRY_NAME || self.sources.remove(name).is_none() {
            return false;
        }
        tracing::info!(name, "source disabled");
        self.broadcast_object_list();
        self.registry_remove(name);
        true
    }

    fn enable_model(&mut self, source: ModelSource) -> Result<(), RepliqError> {
        let name = source.name().to_string();
        let local = self.check_name(&name)?;
        tracing::info!(name, "model enabled");
        self.models.insert(
            name.clone(),
            HostedModel {
                source,
                subscribers: HashSet::new(),
            },
        );
        self.broadcast_object_list();
        self.registry_add(SourceLocation::new(name, local));
        Ok(())
    }

    fn disable_model(&mut self, name: &str) -> bool {
        if self.models.remove(name).is_none() {
            return false;
        }
        tracing::info!(name, "model disabled");
        self.broadcast_object_list();
        self.registry_remove(name);
        true
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    fn start_registry_client(&mut self, url: Endpoint) {
        let core = ReplicaCore::new(
            REGISTRY_NAME.to_string(),
            Some(registry_capabilities()),
            None,
            self.config.channel_capacity,
        );
        let replica = core.id();
        self.replicas.insert(replica, core);
        self.registry = RegistryRole::Client {
            client: RegistryClient::new(),
            replica,
        };
        self.shared.registry_enabled.store(true, Ordering::Release);
        tracing::info!(%url, "using registry");
        self.ensure_link(url, None);
    }

    fn host_registry(&mut self) -> Result<(), RepliqError> {
        if matches!(self.registry, RegistryRole::Host) {
            return Ok(());
        }
        let local = self.check_name(REGISTRY_NAME)?;

        if let RegistryRole::Client { replica, .. } = std::mem::replace(&mut self.registry, RegistryRole::Host)
            && let Some(core) = self.replicas.remove(&replica)
            && let Some(conn) = core.conn()
        {
            self.outgoing.push((
                conn,
                Packet::Release {
                    name: REGISTRY_NAME.to_string(),
                },
            ));
        }

        let mut object = RegistryObject::new();
        let mut signals = Emitter::new();
        let own: Vec<String> = self.sources.keys().chain(self.models.keys()).cloned().collect();
        for name in own {
            object.add(SourceLocation::new(name, local.clone()), None, &mut signals);
        }
        self.shared.registry.publish(object.locations());

        self.sources.insert(
            REGISTRY_NAME.to_string(),
            HostedSource {
                adapter: SourceAdapter::new(REGISTRY_NAME, object),
                subscribers: HashSet::new(),
            },
        );
        self.shared.registry_enabled.store(true, Ordering::Release);
        tracing::info!(%local, "hosting registry");
        self.broadcast_object_list();
        Ok(())
    }

    /// Applies `f` to the hosted registry table and broadcasts the result.
    fn host_update<R>(&mut self, f: impl FnOnce(&mut RegistryObject, &mut Emitter) -> R) -> Option<R> {
        let hosted = self.sources.get_mut(REGISTRY_NAME)?;
        let (result, events) = hosted.adapter.update::<RegistryObject, R>(f)?;
        if events.is_empty() {
            return Some(result);
        }
        let packets = hosted.adapter.packets(&events);
        fan_out(&mut self.outgoing, &hosted.subscribers, packets);
        let table = hosted
            .adapter
            .snapshot()
            .get(LOCATIONS_PROPERTY)
            .map(parse_table)
            .unwrap_or_default();
        self.shared.registry.publish(&table);
        self.bind_unbound();
        Some(result)
    }

    fn registry_add(&mut self, location: SourceLocation) -> bool {
        if matches!(self.registry, RegistryRole::Host) {
            return self
                .host_update(|reg, signals| reg.add(location, None, signals))
                .unwrap_or(false);
        }
        let RegistryRole::Client { client, replica } = &mut self.registry else {
            return false;
        };
        let (accepted, packet) = client.add_source(location);
        if let Some(packet) = packet
            && let Some(conn) = self.replicas.get(replica).and_then(ReplicaCore::conn)
        {
            self.outgoing.push((conn, packet));
        }
        accepted
    }

    fn registry_remove(&mut self, name: &str) -> bool {
        if matches!(self.registry, RegistryRole::Host) {
            let Some(endpoint) = self.shared.registry.resolve(name) else {
                return false;
            };
            let location = SourceLocation::new(name, endpoint);
            return self
                .host_update(|reg, signals| reg.remove(&location, signals))
                .unwrap_or(false);
        }
        let RegistryRole::Client { client, replica } = &mut self.registry else {
            return false;
        };
        let (removed, packet) = client.remove_source(name);
        if let Some(packet) = packet
            && let Some(conn) = self.replicas.get(replica).and_then(ReplicaCore::conn)
        {
            self.outgoing.push((conn, packet));
        }
        removed
    }
}
