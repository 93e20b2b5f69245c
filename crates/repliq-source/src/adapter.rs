//! `SourceAdapter`: a type-erased, capability-checked wrapper around a
//! hosted object.
//!
//! The adapter owns the object and remembers the property values it last
//! published. After every mutation it compares the object's current values
//! against that snapshot and emits a change event for each property that
//! moved, so objects never have to announce their own property changes.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use repliq_protocol::{
    CapabilityMap, ObjectInfo, ObjectSignature, Packet, PropertyModifier, Value, ValueType,
};

use crate::{Emitter, RemoteObject, SourceError, SourceEvent};

/// Packets produced by [`SourceAdapter::dispatch`].
#[derive(Debug, Default, PartialEq)]
pub struct Dispatch {
    /// Goes back to the connection the request came from.
    pub reply: Option<Packet>,
    /// Goes to every replica subscribed to this source.
    pub broadcast: Vec<Packet>,
}

/// Object-safe view of a hosted object that can also be downcast.
trait Hosted: Send {
    fn object(&self) -> &dyn RemoteObject;
    fn object_mut(&mut self) -> &mut dyn RemoteObject;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: RemoteObject> Hosted for T {
    fn object(&self) -> &dyn RemoteObject {
        self
    }

    fn object_mut(&mut self) -> &mut dyn RemoteObject {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A hosted object plus the bookkeeping needed to serve it.
pub struct SourceAdapter {
    name: String,
    api: Arc<CapabilityMap>,
    object: Box<dyn Hosted>,
    published: Vec<Value>,
}

impl SourceAdapter {
    pub fn new<T: RemoteObject>(name: impl Into<String>, object: T) -> Self {
        let api = object.capabilities();
        let published = (0..api.property_count())
            .map(|i| object.property(i))
            .collect();
        Self {
            name: name.into(),
            api,
            object: Box::new(object),
            published,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn api(&self) -> &Arc<CapabilityMap> {
        &self.api
    }

    pub fn signature(&self) -> ObjectSignature {
        self.api.signature()
    }

    /// The entry this source contributes to its node's object list.
    pub fn info(&self) -> ObjectInfo {
        ObjectInfo {
            name: self.name.clone(),
            type_name: self.api.type_name().to_string(),
            signature: self.signature(),
        }
    }

    /// Property values as last published to replicas.
    pub fn snapshot(&self) -> &[Value] {
        &self.published
    }

    /// Answers a handshake. `None` asks for a dynamic replica, which also
    /// receives the capability map.
    pub fn init_reply(&self, requested: Option<ObjectSignature>) -> Packet {
        match requested {
            Some(signature) if signature != self.signature() => {
                tracing::warn!(
                    name = %self.name,
                    ours = %self.signature(),
                    theirs = %signature,
                    "replica signature mismatch"
                );
                Packet::SignatureMismatch {
                    name: self.name.clone(),
                    signature: self.signature(),
                }
            }
            requested => Packet::InitReply {
                name: self.name.clone(),
                signature: self.signature(),
                api: requested.is_none().then(|| (*self.api).clone()),
                properties: self.published.clone(),
            },
        }
    }

    fn check_value(ty: &ValueType, value: &Value) -> Result<(), SourceError> {
        if ty.accepts(value) {
            Ok(())
        } else {
            Err(SourceError::TypeMismatch {
                expected: ty.clone(),
                got: value.clone(),
            })
        }
    }

    /// A replica writes a property. Only `ReadWrite` properties accept
    /// this.
    pub fn write_property(
        &mut self,
        index: usize,
        value: Value,
    ) -> Result<Vec<SourceEvent>, SourceError> {
        let def = self
            .api
            .property(index)
            .ok_or(SourceError::UnknownProperty(index))?;
        if def.modifier != PropertyModifier::ReadWrite {
            return Err(SourceError::NotWritable(def.name.clone()));
        }
        self.store(index, value)
    }

    /// The hosting process writes a property. Any non-constant property
    /// may be set this way.
    pub fn set_property(
        &mut self,
        index: usize,
        value: Value,
    ) -> Result<Vec<SourceEvent>, SourceError> {
        let def = self
            .api
            .property(index)
            .ok_or(SourceError::UnknownProperty(index))?;
        if def.modifier == PropertyModifier::Constant {
            return Err(SourceError::NotWritable(def.name.clone()));
        }
        self.store(index, value)
    }

    fn store(&mut self, index: usize, value: Value) -> Result<Vec<SourceEvent>, SourceError> {
        let api = Arc::clone(&self.api);
        let def = api
            .property(index)
            .ok_or(SourceError::UnknownProperty(index))?;
        Self::check_value(&def.ty, &value)?;
        self.object
            .object_mut()
            .set_property(index, value)
            .map_err(SourceError::Rejected)?;
        Ok(self.collect(&mut Emitter::new()))
    }

    /// Invokes method `method`. Derived `push<Name>` methods write their
    /// property; declared methods run on the object.
    ///
    /// Events are returned even when the call fails, since the object may
    /// have changed state before failing.
    pub fn invoke(
        &mut self,
        method: usize,
        args: Vec<Value>,
    ) -> (Result<Value, SourceError>, Vec<SourceEvent>) {
        let api = Arc::clone(&self.api);
        let Some(def) = api.method(method) else {
            return (Err(SourceError::UnknownMethod(method)), Vec::new());
        };
        if args.len() != def.params.len() {
            let err = SourceError::ArgumentCount {
                name: def.name.clone(),
                expected: def.params.len(),
                got: args.len(),
            };
            return (Err(err), Vec::new());
        }
        if let Some(err) = def
            .params
            .iter()
            .zip(&args)
            .find_map(|(param, arg)| Self::check_value(&param.ty, arg).err())
        {
            return (Err(err), Vec::new());
        }

        let mut emitter = Emitter::new();
        let result = match def.pushes {
            Some(property) => {
                let value = args.into_iter().next().unwrap_or_default();
                self.object
                    .object_mut()
                    .set_property(property, value)
                    .map(|()| Value::Null)
            }
            None => self.object.object_mut().invoke(method, args, &mut emitter),
        };
        let events = self.collect(&mut emitter);
        (result.map_err(SourceError::Rejected), events)
    }

    /// Runs `f` against the concrete object. Returns `None` if the object
    /// is not a `T`.
    pub fn update<T, R>(&mut self, f: impl FnOnce(&mut T, &mut Emitter) -> R) -> Option<(R, Vec<SourceEvent>)>
    where
        T: RemoteObject,
    {
        let mut emitter = Emitter::new();
        let object = self.object.as_any_mut().downcast_mut::<T>()?;
        let result = f(object, &mut emitter);
        Some((result, self.collect(&mut emitter)))
    }

    /// Emits declared signal `index` from the hosting process.
    pub fn emit(&mut self, index: usize, args: Vec<Value>) -> Vec<SourceEvent> {
        let mut emitter = Emitter::new();
        emitter.emit(index, args);
        self.collect(&mut emitter)
    }

    /// Diffs properties against the published snapshot, then appends the
    /// queued signals. Malformed signals are dropped.
    fn collect(&mut self, emitter: &mut Emitter) -> Vec<SourceEvent> {
        let mut events = Vec::new();
        let object = self.object.object();
        for (index, def) in self.api.properties().iter().enumerate() {
            let current = object.property(index);
            if current == self.published[index] {
                continue;
            }
            if def.modifier.notifies() {
                events.push(SourceEvent::PropertyChanged {
                    index,
                    value: current.clone(),
                });
            }
            self.published[index] = current;
        }

        for (index, args) in emitter.drain() {
            match self.api.signal(index) {
                Some(def) if def.params.len() == args.len() => {
                    events.push(SourceEvent::Signal { index, args });
                }
                Some(def) => tracing::warn!(
                    name = %self.name,
                    signal = %def.name,
                    expected = def.params.len(),
                    got = args.len(),
                    "dropping signal with wrong argument count"
                ),
                None => tracing::warn!(name = %self.name, index, "dropping unknown signal"),
            }
        }
        events
    }

    /// Handles a request from a replica.
    ///
    /// Malformed requests are logged and answered only when the protocol
    /// demands an answer (a method call with a correlation id).
    pub fn dispatch(&mut self, packet: Packet) -> Dispatch {
        let mut out = Dispatch::default();
        match packet {
            Packet::Handshake { signature, .. } => {
                out.reply = Some(self.init_reply(signature));
            }
            Packet::SetProperty { index, value, .. } => {
                match self.write_property(index as usize, value) {
                    Ok(events) => out.broadcast = self.packets(&events),
                    Err(e) => tracing::warn!(name = %self.name, index, error = %e, "refused property write"),
                }
            }
            Packet::Invoke {
                method,
                args,
                call_id,
                ..
            } => {
                let (result, events) = self.invoke(method as usize, args);
                if let Err(e) = &result {
                    tracing::debug!(name = %self.name, method, error = %e, "invocation failed");
                }
                out.broadcast = self.packets(&events);
                out.reply = call_id.map(|call_id| Packet::InvokeReply {
                    name: self.name.clone(),
                    call_id,
                    result: result.map_err(|e| e.to_string()),
                });
            }
            other => {
                tracing::warn!(name = %self.name, kind = other.kind(), "unexpected packet for source");
            }
        }
        out
    }

    /// Converts events into packets for this source.
    pub fn packets(&self, events: &[SourceEvent]) -> Vec<Packet> {
        events.iter().map(|e| e.to_packet(&self.name)).collect()
    }
}

impl fmt::Debug for SourceAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceAdapter")
            .field("name", &self.name)
            .field("type", &self.api.type_name())
            .field("published", &self.published)
            .finish_non_exhaustive()
    }
}
