//! Replicas: live proxies of remote sources.
//!
//! A replica is split in two. [`Replica`] is the handle the application
//! holds; it reads cached values and queues writes and calls without ever
//! waiting on I/O. [`ReplicaCore`] lives inside the node's actor and is the
//! only thing that mutates replica state, in response to packets and link
//! changes.
//!
//! # States
//!
//! ```text
//!                  handshake sent          InitReply
//! Uninitialized ─────────────────▶ Connecting ─────────▶ Valid
//!                                     │  ▲                 │
//!                 SignatureMismatch   │  │ source seen     │ link lost /
//!                 (terminal)  ◀───────┘  │ again           │ source gone
//!                                        └──── Suspect ◀───┘
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use repliq_protocol::{CapabilityMap, ObjectSignature, Packet, PropertyModifier, Value};
use repliq_source::PersistedStore;
use repliq_transport::ConnectionId;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::actor::Command;
use crate::{CallError, PendingCall, ReplicaError};

/// Counter for generating unique replica IDs.
static NEXT_REPLICA_ID: AtomicU64 = AtomicU64::new(1);

/// Call ids are unique per process, so replicas sharing a connection never
/// confuse each other's replies.
static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one replica (or model replica) within its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplicaId(u64);

impl ReplicaId {
    pub(crate) fn next() -> Self {
        Self(NEXT_REPLICA_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "replica-{}", self.0)
    }
}

/// Lifecycle state of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicaState {
    /// Created, no source found yet.
    Uninitialized,
    /// Handshake sent, waiting for the initial snapshot.
    Connecting,
    /// Synchronized with the source.
    Valid,
    /// The source's type differs. Terminal.
    SignatureMismatch,
    /// The source was lost; cached values are the last ones seen.
    Suspect,
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Connecting => "connecting",
            Self::Valid => "valid",
            Self::SignatureMismatch => "signature-mismatch",
            Self::Suspect => "suspect",
        })
    }
}

/// Something a replica observed.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaEvent {
    StateChanged { old: ReplicaState, new: ReplicaState },
    /// The initial snapshot was adopted.
    Initialized,
    PropertyChanged { index: usize, value: Value },
    Signal { index: usize, args: Vec<Value> },
}

/// What the handle and the core both see.
struct View {
    state: ReplicaState,
    api: Option<Arc<CapabilityMap>>,
    values: Vec<Value>,
    /// Set once any snapshot was adopted; gates persistence.
    initialized: bool,
}

pub(crate) struct ReplicaShared {
    name: String,
    /// Signature the replica was built for; `None` for dynamic replicas.
    expected: Option<ObjectSignature>,
    view: RwLock<View>,
    state_tx: watch::Sender<ReplicaState>,
    events: broadcast::Sender<ReplicaEvent>,
}

impl ReplicaShared {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> ReplicaState {
        self.view.read().state
    }

    pub(crate) fn value(&self, index: usize) -> Option<Value> {
        self.view.read().values.get(index).cloned()
    }

    fn publish(&self, event: ReplicaEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

// ---------------------------------------------------------------------------
// Replica (handle)
// ---------------------------------------------------------------------------

/// Application-side handle of a replica.
///
/// Obtained from [`Node::acquire`](crate::Node::acquire) or
/// [`Node::acquire_dynamic`](crate::Node::acquire_dynamic). Dropping it
/// releases the replica: outstanding calls fail with
/// [`CallError::Released`] and the source stops sending updates.
pub struct Replica {
    id: ReplicaId,
    shared: Arc<ReplicaShared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Replica {
    pub(crate) fn new(
        id: ReplicaId,
        shared: Arc<ReplicaShared>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            id,
            shared,
            commands,
        }
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// Name of the source this replica mirrors.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ReplicaState {
        self.shared.state()
    }

    /// Returns `true` for replicas that adopt whatever type the source has.
    pub fn is_dynamic(&self) -> bool {
        self.shared.expected.is_none()
    }

    /// The capability map in use. Dynamic replicas have none until their
    /// first snapshot arrives.
    pub fn api(&self) -> Option<Arc<CapabilityMap>> {
        self.shared.view.read().api.clone()
    }

    /// Returns `true` once a snapshot from the source has been adopted.
    pub fn is_initialized(&self) -> bool {
        self.shared.view.read().initialized
    }

    /// Cached value of property `index`.
    ///
    /// Unknown indices and replicas in `SignatureMismatch` read as the
    /// property type's default (or `Null`).
    pub fn property(&self, index: usize) -> Value {
        let view = self.shared.view.read();
        let default = || {
            view.api
                .as_ref()
                .and_then(|api| api.property(index))
                .map_or(Value::Null, |def| def.ty.default_value())
        };
        if view.state == ReplicaState::SignatureMismatch {
            return default();
        }
        view.values.get(index).cloned().unwrap_or_else(default)
    }

    /// Cached value of the property called `name`.
    pub fn property_by_name(&self, name: &str) -> Value {
        let index = self.api().and_then(|api| api.property_index(name));
        index.map_or(Value::Null, |i| self.property(i))
    }

    /// All cached property values in declaration order.
    pub fn properties(&self) -> Vec<Value> {
        self.shared.view.read().values.clone()
    }

    /// Subscribes to this replica's events.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicaEvent> {
        self.shared.events.subscribe()
    }

    /// Waits until the replica is `Valid` or `SignatureMismatch` and
    /// returns that state.
    pub async fn wait_for_source(&self) -> ReplicaState {
        let mut rx = self.shared.state_tx.subscribe();
        let settled = rx
            .wait_for(|s| matches!(s, ReplicaState::Valid | ReplicaState::SignatureMismatch))
            .await;
        match settled {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    fn writable_api(&self) -> Result<Arc<CapabilityMap>, ReplicaError> {
        let view = self.shared.view.read();
        match view.state {
            ReplicaState::Valid => {}
            ReplicaState::SignatureMismatch => return Err(ReplicaError::SignatureMismatch),
            other => return Err(ReplicaError::NotValid(other)),
        }
        view.api.clone().ok_or(ReplicaError::NotValid(view.state))
    }

    /// Asks the source to change property `index`.
    ///
    /// `ReadWrite` properties are written directly and `ReadPush`
    /// properties through their push method. The cached value changes
    /// only when the source confirms.
    pub fn set_property(&self, index: usize, value: Value) -> Result<(), ReplicaError> {
        let api = self.writable_api()?;
        let def = api
            .property(index)
            .ok_or(ReplicaError::UnknownProperty(index))?;
        if !def.ty.accepts(&value) {
            return Err(ReplicaError::TypeMismatch {
                expected: def.ty.clone(),
            });
        }
        let packet = match def.modifier {
            PropertyModifier::ReadWrite => Packet::SetProperty {
                name: self.shared.name.clone(),
                index: index as u32,
                value,
            },
            PropertyModifier::ReadPush => {
                let method = api
                    .methods()
                    .iter()
                    .position(|m| m.pushes == Some(index))
                    .ok_or_else(|| ReplicaError::NotWritable(def.name.clone()))?;
                Packet::Invoke {
                    name: self.shared.name.clone(),
                    method: method as u32,
                    args: vec![value],
                    call_id: None,
                }
            }
            _ => return Err(ReplicaError::NotWritable(def.name.clone())),
        };
        self.commands
            .send(Command::ReplicaSend {
                replica: self.id,
                packet,
            })
            .map_err(|_| ReplicaError::Shutdown)
    }

    /// Invokes method `method` on the source.
    ///
    /// Fails fast (through the returned handle) unless the replica is
    /// `Valid`. Void methods resolve to `Null` as soon as they are sent.
    pub fn call(&self, method: usize, args: Vec<Value>) -> PendingCall {
        let api = match self.writable_api() {
            Ok(api) => api,
            Err(_) => return PendingCall::done(Err(CallError::NotValid(self.state()))),
        };
        let Some(def) = api.method(method) else {
            return PendingCall::done(Err(CallError::UnknownMethod(method)));
        };
        let call_id = (!def.is_void()).then(|| NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed));
        let packet = Packet::Invoke {
            name: self.shared.name.clone(),
            method: method as u32,
            args,
            call_id,
        };

        let Some(call_id) = call_id else {
            let sent = self.commands.send(Command::ReplicaSend {
                replica: self.id,
                packet,
            });
            return PendingCall::done(sent.map(|()| Value::Null).map_err(|_| CallError::ConnectionLost));
        };

        let (tx, rx) = oneshot::channel();
        let sent = self.commands.send(Command::Call {
            replica: self.id,
            call_id,
            packet,
            reply: tx,
        });
        match sent {
            Ok(()) => PendingCall::waiting(rx, call_id, self.id, self.commands.clone()),
            Err(_) => PendingCall::done(Err(CallError::ConnectionLost)),
        }
    }

    /// Invokes the method called `name`.
    pub fn call_by_name(&self, name: &str, args: Vec<Value>) -> PendingCall {
        match self.api().and_then(|api| api.method_index(name)) {
            Some(index) => self.call(index, args),
            None => PendingCall::done(Err(CallError::NotValid(self.state()))),
        }
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::ReleaseReplica { replica: self.id });
    }
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("id", &self.id)
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ReplicaCore (actor side)
// ---------------------------------------------------------------------------

type Reply = oneshot::Sender<Result<Value, CallError>>;

/// Actor-side state of one replica.
pub(crate) struct ReplicaCore {
    id: ReplicaId,
    shared: Arc<ReplicaShared>,
    /// The connection the replica is bound to.
    conn: Option<ConnectionId>,
    pending: HashMap<u64, Reply>,
}

impl ReplicaCore {
    /// Creates a replica. Static replicas (with `api`) start from values
    /// restored from `store` when it has some for this signature.
    pub(crate) fn new(
        name: String,
        api: Option<Arc<CapabilityMap>>,
        store: Option<&dyn PersistedStore>,
        capacity: usize,
    ) -> Self {
        let expected = api.as_ref().map(|api| api.signature());
        let values = match &api {
            Some(api) => store
                .and_then(|s| s.restore(api.type_name(), api.signature()))
                .filter(|v| v.len() == api.property_count())
                .unwrap_or_else(|| api.default_values()),
            None => Vec::new(),
        };
        let (state_tx, _) = watch::channel(ReplicaState::Uninitialized);
        let (events, _) = broadcast::channel(capacity);
        let shared = Arc::new(ReplicaShared {
            name,
            expected,
            view: RwLock::new(View {
                state: ReplicaState::Uninitialized,
                api,
                values,
                initialized: false,
            }),
            state_tx,
            events,
        });
        Self {
            id: ReplicaId::next(),
            shared,
            conn: None,
            pending: HashMap::new(),
        }
    }

    pub(crate) fn id(&self) -> ReplicaId {
        self.id
    }

    pub(crate) fn shared(&self) -> &Arc<ReplicaShared> {
        &self.shared
    }

    pub(crate) fn name(&self) -> &str {
        &self.shared.name
    }

    pub(crate) fn conn(&self) -> Option<ConnectionId> {
        self.conn
    }

    pub(crate) fn state(&self) -> ReplicaState {
        self.shared.state()
    }

    /// Returns `true` if the replica wants a source: not bound and not
    /// terminally mismatched.
    pub(crate) fn is_unbound(&self) -> bool {
        self.conn.is_none() && self.state() != ReplicaState::SignatureMismatch
    }

    fn set_state(&self, new: ReplicaState, events: &mut Vec<ReplicaEvent>) {
        let old = {
            let mut view = self.shared.view.write();
            std::mem::replace(&mut view.state, new)
        };
        if old != new {
            tracing::debug!(name = %self.shared.name, %old, %new, "replica state changed");
            self.shared.state_tx.send_replace(new);
            events.push(ReplicaEvent::StateChanged { old, new });
        }
    }

    fn fail_pending(&mut self, error: CallError) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(error.clone()));
        }
    }

    fn finish(&self, events: Vec<ReplicaEvent>) -> Vec<ReplicaEvent> {
        for event in &events {
            self.shared.publish(event.clone());
        }
        events
    }

    /// Binds to `conn` and returns the handshake to send there.
    pub(crate) fn bind(&mut self, conn: ConnectionId) -> (Packet, Vec<ReplicaEvent>) {
        let mut events = Vec::new();
        self.conn = Some(conn);
        self.set_state(ReplicaState::Connecting, &mut events);
        let packet = Packet::Handshake {
            name: self.shared.name.clone(),
            signature: self.shared.expected,
        };
        (packet, self.finish(events))
    }

    /// The bound connection or the source went away.
    pub(crate) fn link_lost(&mut self) -> Vec<ReplicaEvent> {
        self.conn = None;
        self.fail_pending(CallError::ConnectionLost);
        let mut events = Vec::new();
        match self.state() {
            ReplicaState::SignatureMismatch | ReplicaState::Uninitialized => {}
            _ => self.set_state(ReplicaState::Suspect, &mut events),
        }
        self.finish(events)
    }

    /// Registers a call awaiting its reply. Calls made while not `Valid`
    /// fail immediately.
    pub(crate) fn register_call(&mut self, call_id: u64, reply: Reply) -> bool {
        if self.state() != ReplicaState::Valid || self.conn.is_none() {
            let _ = reply.send(Err(CallError::ConnectionLost));
            return false;
        }
        self.pending.insert(call_id, reply);
        true
    }

    pub(crate) fn has_call(&self, call_id: u64) -> bool {
        self.pending.contains_key(&call_id)
    }

    pub(crate) fn cancel_call(&mut self, call_id: u64) {
        self.pending.remove(&call_id);
    }

    /// Releases the replica: fails its calls and saves its values.
    pub(crate) fn release(mut self, store: Option<&dyn PersistedStore>) {
        self.fail_pending(CallError::Released);
        let view = self.shared.view.read();
        if let (Some(store), Some(api), true) = (store, &view.api, view.initialized)
            && self.shared.expected.is_some()
            && view.state != ReplicaState::SignatureMismatch
        {
            store.save(api.type_name(), api.signature(), &view.values);
        }
    }

    /// Applies a packet from the source.
    pub(crate) fn handle(&mut self, packet: Packet) -> Vec<ReplicaEvent> {
        let mut events = Vec::new();
        match packet {
            Packet::InitReply {
                signature,
                api,
                properties,
                ..
            } => self.on_init(signature, api, properties, &mut events),
            Packet::SignatureMismatch { signature, .. } => {
                tracing::warn!(
                    name = %self.shared.name,
                    source = %signature,
                    "source signature differs; replica disabled"
                );
                self.conn = None;
                self.fail_pending(CallError::ConnectionLost);
                self.set_state(ReplicaState::SignatureMismatch, &mut events);
            }
            Packet::PropertyChanged { index, value, .. } => {
                self.on_property(index as usize, value, &mut events);
            }
            Packet::Signal { index, args, .. } => self.on_signal(index as usize, args, &mut events),
            Packet::InvokeReply { call_id, result, .. } => match self.pending.remove(&call_id) {
                Some(reply) => {
                    let _ = reply.send(result.map_err(CallError::Remote));
                }
                None => tracing::debug!(name = %self.shared.name, call_id, "reply for unknown call"),
            },
            other => {
                tracing::warn!(name = %self.shared.name, kind = other.kind(), "unexpected packet for replica");
            }
        }
        self.finish(events)
    }

    fn on_init(
        &mut self,
        signature: ObjectSignature,
        api: Option<CapabilityMap>,
        properties: Vec<Value>,
        events: &mut Vec<ReplicaEvent>,
    ) {
        if self.state() == ReplicaState::SignatureMismatch {
            return;
        }
        if let Some(expected) = self.shared.expected
            && expected != signature
        {
            tracing::warn!(name = %self.shared.name, %expected, source = %signature, "signature mismatch");
            self.conn = None;
            self.set_state(ReplicaState::SignatureMismatch, events);
            return;
        }
        let adopted = api.filter(|_| self.shared.expected.is_none());
        let count = match &adopted {
            Some(api) => Some(api.property_count()),
            None => self.shared.view.read().api.as_ref().map(|a| a.property_count()),
        };
        if let Some(count) = count
            && properties.len() != count
        {
            tracing::warn!(
                name = %self.shared.name,
                expected = count,
                got = properties.len(),
                "snapshot has the wrong number of properties; dropped"
            );
            return;
        }
        {
            let mut view = self.shared.view.write();
            if let Some(api) = adopted {
                view.api = Some(Arc::new(api));
            }
            view.values = properties;
            view.initialized = true;
        }
        tracing::info!(name = %self.shared.name, "replica initialized");
        events.push(ReplicaEvent::Initialized);
        self.set_state(ReplicaState::Valid, events);
    }

    fn on_property(&mut self, index: usize, value: Value, events: &mut Vec<ReplicaEvent>) {
        {
            let mut view = self.shared.view.write();
            let Some(slot) = view.values.get_mut(index) else {
                tracing::warn!(name = %self.shared.name, index, "change for unknown property");
                return;
            };
            *slot = value.clone();
        }
        events.push(ReplicaEvent::PropertyChanged { index, value });
    }

    fn on_signal(&mut self, index: usize, args: Vec<Value>, events: &mut Vec<ReplicaEvent>) {
        let api = self.shared.view.read().api.clone();
        let Some(api) = api else {
            return;
        };
        let Some(types) = api.signal_parameter_types(index) else {
            tracing::warn!(name = %self.shared.name, index, "unknown signal");
            return;
        };
        if types.len() != args.len() || !types.iter().zip(&args).all(|(ty, arg)| ty.accepts(arg)) {
            tracing::warn!(name = %self.shared.name, index, "signal arguments do not match");
            return;
        }
        // Notify signals carry the new value of their property.
        if let Some(property) = api.property_index_from_signal(index)
            && let [value] = args.as_slice()
        {
            self.on_property(property, value.clone(), events);
            return;
        }
        events.push(ReplicaEvent::Signal { index, args });
    }
}
