//! The `RemoteObject` trait: what a hostable object must provide.
//!
//! Everything is addressed by the indices of the object's
//! [`CapabilityMap`]. Derived members (notify signals, `push<Name>`
//! methods) are handled by [`SourceAdapter`](crate::SourceAdapter) and
//! never reach the object.

use std::sync::Arc;

use repliq_protocol::{CapabilityMap, Packet, Value};

/// An object that can be served to replicas.
///
/// The capability map must be built once per *type* and shared by every
/// instance; the usual pattern is a `OnceLock`:
///
/// ```rust
/// use std::sync::{Arc, OnceLock};
/// use repliq_protocol::{CapabilityMap, PropertyModifier, Value, ValueType};
/// use repliq_source::{Emitter, RemoteObject};
///
/// struct Thermostat {
///     target: f64,
/// }
///
/// impl RemoteObject for Thermostat {
///     fn capabilities(&self) -> Arc<CapabilityMap> {
///         static MAP: OnceLock<Arc<CapabilityMap>> = OnceLock::new();
///         MAP.get_or_init(|| {
///             Arc::new(
///                 CapabilityMap::builder("Thermostat")
///                     .property("target", ValueType::Double, PropertyModifier::ReadWrite)
///                     .build(),
///             )
///         })
///         .clone()
///     }
///
///     fn property(&self, _index: usize) -> Value {
///         Value::Double(self.target)
///     }
///
///     fn set_property(&mut self, _index: usize, value: Value) -> Result<(), String> {
///         self.target = value.as_f64().ok_or("not a number")?;
///         Ok(())
///     }
///
///     fn invoke(&mut self, _: usize, _: Vec<Value>, _: &mut Emitter) -> Result<Value, String> {
///         Err("no methods".into())
///     }
/// }
/// ```
pub trait RemoteObject: Send + 'static {
    /// The shared description of this object's type.
    fn capabilities(&self) -> Arc<CapabilityMap>;

    /// Current value of the property at `index`.
    fn property(&self, index: usize) -> Value;

    /// Stores a new value. Called for replica writes to `ReadWrite`
    /// properties, for `push<Name>` calls, and for source-side
    /// [`SourceAdapter::set_property`](crate::SourceAdapter::set_property).
    /// The value has already been type-checked.
    fn set_property(&mut self, index: usize, value: Value) -> Result<(), String>;

    /// Runs a declared method. Arguments are already count- and
    /// type-checked. Signals emitted through `signals` are forwarded to
    /// every replica after the call returns; property changes are
    /// detected automatically.
    fn invoke(&mut self, method: usize, args: Vec<Value>, signals: &mut Emitter)
        -> Result<Value, String>;
}

/// A change a source publishes to its replicas.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    PropertyChanged { index: usize, value: Value },
    Signal { index: usize, args: Vec<Value> },
}

impl SourceEvent {
    /// The packet announcing this event for object `name`.
    pub fn to_packet(&self, name: &str) -> Packet {
        match self {
            Self::PropertyChanged { index, value } => Packet::PropertyChanged {
                name: name.to_string(),
                index: *index as u32,
                value: value.clone(),
            },
            Self::Signal { index, args } => Packet::Signal {
                name: name.to_string(),
                index: *index as u32,
                args: args.clone(),
            },
        }
    }
}

/// Collects signals an object emits during a call.
#[derive(Debug, Default)]
pub struct Emitter {
    signals: Vec<(usize, Vec<Value>)>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues signal `index` with `args`.
    pub fn emit(&mut self, index: usize, args: impl Into<Vec<Value>>) {
        self.signals.push((index, args.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub(crate) fn drain(&mut self) -> std::vec::Drain<'_, (usize, Vec<Value>)> {
        self.signals.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_event_to_packet() {
        let event = SourceEvent::Signal {
            index: 3,
            args: vec![Value::Int(1)],
        };
        assert_eq!(
            event.to_packet("alpha"),
            Packet::Signal {
                name: "alpha".into(),
                index: 3,
                args: vec![Value::Int(1)],
            }
        );
    }

    #[test]
    fn test_emitter_keeps_emission_order() {
        let mut emitter = Emitter::new();
        assert!(emitter.is_empty());
        emitter.emit(2, vec![]);
        emitter.emit(1, [Value::Bool(true)]);
        let order: Vec<_> = emitter.drain().map(|(i, _)| i).collect();
        assert_eq!(order, [2, 1]);
        assert!(emitter.is_empty());
    }
}
