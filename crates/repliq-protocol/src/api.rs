//! Capability maps: the static description of a remotable object type.
//!
//! A [`CapabilityMap`] lists an object type's properties, signals, methods
//! and enums by stable integer index. Both ends of a connection address
//! members by these indices, and the [`ObjectSignature`] computed from the
//! map decides whether a source and a replica agree on the type.
//!
//! Maps are built once per type with [`CapabilityMap::builder`] and shared
//! behind an `Arc` by every instance of that type.
//!
//! # Derived members
//!
//! The builder derives members the way an interface compiler would:
//!
//! - every non-constant property gets a `<name>Changed(value)` notify
//!   signal, placed before the declared signals in property order;
//! - every `ReadPush` property gets a `push<Name>(value)` method, placed
//!   before the declared methods.
//!
//! Derived members are not hashed on their own: the property (including
//! its modifier) already determines them.

use serde::{Deserialize, Serialize};

use crate::signature::{self, ObjectSignature};
use crate::ValueType;

/// How a property may be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyModifier {
    /// Set once at initialization, never changes.
    Constant,
    /// Changed only by the source.
    ReadOnly,
    /// Replicas may write it directly.
    ReadWrite,
    /// Replicas request changes through the derived `push<Name>` method.
    ReadPush,
    /// Source-side setter only; replicas observe changes.
    SourceOnlySetter,
}

impl PropertyModifier {
    /// Stable tag hashed into signatures.
    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::Constant => 0,
            Self::ReadOnly => 1,
            Self::ReadWrite => 2,
            Self::ReadPush => 3,
            Self::SourceOnlySetter => 4,
        }
    }

    /// Returns `true` if the property ever emits change notifications.
    pub fn notifies(self) -> bool {
        !matches!(self, Self::Constant)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDef {
    pub name: String,
    pub ty: ValueType,
    pub modifier: PropertyModifier,
    /// Index of the notify signal, if the property has one.
    pub notify: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDef {
    pub name: String,
    pub ty: ValueType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalDef {
    pub name: String,
    pub params: Vec<ParamDef>,
    /// The property this signal notifies, for derived notify signals.
    pub property: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    pub params: Vec<ParamDef>,
    pub returns: ValueType,
    /// The property this method pushes, for derived `push<Name>` methods.
    pub pushes: Option<usize>,
}

impl MethodDef {
    /// Returns `true` if invoking this method produces no reply.
    pub fn is_void(&self) -> bool {
        self.returns == ValueType::Void
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumDef {
    pub name: String,
    pub values: Vec<(String, i64)>,
}

/// Static description of a remotable object type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityMap {
    type_name: String,
    properties: Vec<PropertyDef>,
    signals: Vec<SignalDef>,
    methods: Vec<MethodDef>,
    enums: Vec<EnumDef>,
    signature: ObjectSignature,
}

impl CapabilityMap {
    /// Starts describing a type.
    pub fn builder(type_name: impl Into<String>) -> CapabilityMapBuilder {
        CapabilityMapBuilder {
            type_name: type_name.into(),
            properties: Vec::new(),
            signals: Vec::new(),
            methods: Vec::new(),
            enums: Vec::new(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The structural digest of this type.
    pub fn signature(&self) -> ObjectSignature {
        self.signature
    }

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    pub fn signal_count(&self) -> usize {
        self.signals.len()
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    pub fn properties(&self) -> &[PropertyDef] {
        &self.properties
    }

    pub fn signals(&self) -> &[SignalDef] {
        &self.signals
    }

    pub fn methods(&self) -> &[MethodDef] {
        &self.methods
    }

    pub fn enums(&self) -> &[EnumDef] {
        &self.enums
    }

    pub fn property(&self, index: usize) -> Option<&PropertyDef> {
        self.properties.get(index)
    }

    pub fn signal(&self, index: usize) -> Option<&SignalDef> {
        self.signals.get(index)
    }

    pub fn method(&self, index: usize) -> Option<&MethodDef> {
        self.methods.get(index)
    }

    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }

    pub fn signal_index(&self, name: &str) -> Option<usize> {
        self.signals.iter().position(|s| s.name == name)
    }

    pub fn method_index(&self, name: &str) -> Option<usize> {
        self.methods.iter().position(|m| m.name == name)
    }

    /// Maps a notify signal back to the property it notifies. `None` for
    /// ordinary signals and out-of-range indices.
    pub fn property_index_from_signal(&self, signal: usize) -> Option<usize> {
        self.signals.get(signal).and_then(|s| s.property)
    }

    /// Argument types of a signal, in declaration order.
    pub fn signal_parameter_types(&self, signal: usize) -> Option<Vec<&ValueType>> {
        self.signals
            .get(signal)
            .map(|s| s.params.iter().map(|p| &p.ty).collect())
    }

    /// Argument types of a method, in declaration order.
    pub fn method_parameter_types(&self, method: usize) -> Option<Vec<&ValueType>> {
        self.methods
            .get(method)
            .map(|m| m.params.iter().map(|p| &p.ty).collect())
    }

    /// Returns the child kind of a property: a nested object or a model.
    pub fn child_property(&self, index: usize) -> Option<&ValueType> {
        self.properties
            .get(index)
            .map(|p| &p.ty)
            .filter(|ty| ty.is_child())
    }

    /// Default value for every property, in index order.
    pub fn default_values(&self) -> Vec<crate::Value> {
        self.properties.iter().map(|p| p.ty.default_value()).collect()
    }

    /// Enum definition by name.
    pub fn enumeration(&self, name: &str) -> Option<&EnumDef> {
        self.enums.iter().find(|e| e.name == name)
    }
}

/// Builder returned by [`CapabilityMap::builder`].
#[derive(Debug, Clone)]
pub struct CapabilityMapBuilder {
    type_name: String,
    properties: Vec<(String, ValueType, PropertyModifier)>,
    signals: Vec<(String, Vec<ParamDef>)>,
    methods: Vec<(String, Vec<ParamDef>, ValueType)>,
    enums: Vec<EnumDef>,
}

fn params<N: Into<String>>(list: impl IntoIterator<Item = (N, ValueType)>) -> Vec<ParamDef> {
    list.into_iter()
        .map(|(name, ty)| ParamDef { name: name.into(), ty })
        .collect()
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl CapabilityMapBuilder {
    pub fn property(mut self, name: impl Into<String>, ty: ValueType, modifier: PropertyModifier) -> Self {
        self.properties.push((name.into(), ty, modifier));
        self
    }

    pub fn signal<N: Into<String>>(
        mut self,
        name: impl Into<String>,
        args: impl IntoIterator<Item = (N, ValueType)>,
    ) -> Self {
        self.signals.push((name.into(), params(args)));
        self
    }

    pub fn method<N: Into<String>>(
        mut self,
        name: impl Into<String>,
        args: impl IntoIterator<Item = (N, ValueType)>,
        returns: ValueType,
    ) -> Self {
        self.methods.push((name.into(), params(args), returns));
        self
    }

    pub fn enumeration<N: Into<String>>(
        mut self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = (N, i64)>,
    ) -> Self {
        self.enums.push(EnumDef {
            name: name.into(),
            values: values.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        });
        self
    }

    /// Lays out the index tables and computes the signature.
    pub fn build(self) -> CapabilityMap {
        let mut properties = Vec::with_capacity(self.properties.len());
        let mut signals = Vec::new();
        let mut methods = Vec::new();

        for (index, (name, ty, modifier)) in self.properties.iter().enumerate() {
            let notify = modifier.notifies().then(|| {
                signals.push(SignalDef {
                    name: format!("{name}Changed"),
                    params: vec![ParamDef { name: name.clone(), ty: ty.clone() }],
                    property: Some(index),
                });
                signals.len() - 1
            });
            if *modifier == PropertyModifier::ReadPush {
                methods.push(MethodDef {
                    name: format!("push{}", capitalize(name)),
                    params: vec![ParamDef { name: name.clone(), ty: ty.clone() }],
                    returns: ValueType::Void,
                    pushes: Some(index),
                });
            }
            properties.push(PropertyDef {
                name: name.clone(),
                ty: ty.clone(),
                modifier: *modifier,
                notify,
            });
        }

        signals.extend(self.signals.into_iter().map(|(name, params)| SignalDef {
            name,
            params,
            property: None,
        }));
        methods.extend(self.methods.into_iter().map(|(name, params, returns)| MethodDef {
            name,
            params,
            returns,
            pushes: None,
        }));

        let mut map = CapabilityMap {
            type_name: self.type_name,
            properties,
            signals,
            methods,
            enums: self.enums,
            signature: ObjectSignature::ZERO,
        };
        map.signature = signature::compute(&map);
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    fn counter() -> CapabilityMap {
        CapabilityMap::builder("Counter")
            .enumeration("Mode", [("Idle", 0), ("Busy", 1)])
            .property("count", ValueType::Int, PropertyModifier::ReadPush)
            .property("label", ValueType::String, PropertyModifier::ReadWrite)
            .property("id", ValueType::UInt, PropertyModifier::Constant)
            .property("mode", ValueType::Enum("Mode".into()), PropertyModifier::ReadOnly)
            .signal("overflowed", [("at", ValueType::Int)])
            .method("reset", Vec::<(String, ValueType)>::new(), ValueType::Void)
            .method("add", [("a", ValueType::Int), ("b", ValueType::Int)], ValueType::Int)
            .build()
    }

    #[test]
    fn test_build_derives_notify_signals_before_declared() {
        let map = counter();
        let names: Vec<_> = map.signals().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["countChanged", "labelChanged", "modeChanged", "overflowed"]);
    }

    #[test]
    fn test_build_derives_push_methods_before_declared() {
        let map = counter();
        let names: Vec<_> = map.methods().iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["pushCount", "reset", "add"]);
        assert_eq!(map.method(0).unwrap().pushes, Some(0));
        assert!(map.method(1).unwrap().is_void());
        assert!(!map.method(2).unwrap().is_void());
    }

    #[test]
    fn test_property_index_from_signal() {
        let map = counter();
        assert_eq!(map.property_index_from_signal(0), Some(0));
        assert_eq!(map.property_index_from_signal(2), Some(3));
        assert_eq!(map.property_index_from_signal(3), None);
        assert_eq!(map.property_index_from_signal(99), None);
    }

    #[test]
    fn test_constant_property_has_no_notify_signal() {
        let map = counter();
        let id = map.property_index("id").unwrap();
        assert_eq!(map.property(id).unwrap().notify, None);
        assert_eq!(map.property(0).unwrap().notify, Some(0));
    }

    #[test]
    fn test_lookup_by_name() {
        let map = counter();
        assert_eq!(map.property_index("label"), Some(1));
        assert_eq!(map.signal_index("overflowed"), Some(3));
        assert_eq!(map.method_index("add"), Some(2));
        assert_eq!(map.method_index("missing"), None);
        assert_eq!(
            map.method_parameter_types(2).unwrap(),
            vec![&ValueType::Int, &ValueType::Int]
        );
    }

    #[test]
    fn test_child_property_detection() {
        let map = CapabilityMap::builder("Parent")
            .property("rows", ValueType::Model, PropertyModifier::Constant)
            .property("child", ValueType::Object("Child".into()), PropertyModifier::ReadOnly)
            .property("plain", ValueType::Int, PropertyModifier::ReadOnly)
            .build();
        assert_eq!(map.child_property(0), Some(&ValueType::Model));
        assert!(map.child_property(1).is_some());
        assert_eq!(map.child_property(2), None);
    }

    #[test]
    fn test_default_values_follow_property_types() {
        let map = counter();
        assert_eq!(
            map.default_values(),
            vec![Value::Int(0), Value::String(String::new()), Value::UInt(0), Value::Int(0)]
        );
    }
}
