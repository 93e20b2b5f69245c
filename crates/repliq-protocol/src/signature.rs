//! Structural signatures for capability maps.
//!
//! The digest covers the type name, every property (name, type, modifier),
//! every declared signal (name, parameter names and types) and every
//! declared method (name, parameters, return type), each in declaration
//! order. Enum-typed members hash the enum's full key/value table instead
//! of its bare name, so renumbering an enum changes the signature while
//! reordering enum *declarations* does not.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::api::{CapabilityMap, ParamDef};
use crate::ValueType;

/// A fixed-length structural digest. Two endpoints agree on a type iff
/// their signatures are bit-equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectSignature(pub [u8; 32]);

impl ObjectSignature {
    /// Placeholder used only while a map is being built.
    pub(crate) const ZERO: Self = Self([0; 32]);

    /// Parses the hex form produced by `Display`.
    pub fn from_hex(raw: &str) -> Option<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(raw, &mut bytes).ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for ObjectSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ObjectSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectSignature({})", &hex::encode(self.0)[..12])
    }
}

/// Incremental hasher; every field is terminated so adjacent strings
/// cannot run together.
struct SignatureHasher<'a> {
    sha: Sha256,
    map: &'a CapabilityMap,
}

impl<'a> SignatureHasher<'a> {
    fn field(&mut self, bytes: &[u8]) {
        self.sha.update(bytes);
        self.sha.update([0u8]);
    }

    fn ty(&mut self, ty: &ValueType) {
        match ty {
            ValueType::Enum(name) => match self.map.enumeration(name) {
                Some(def) => {
                    self.field(def.name.as_bytes());
                    for (key, value) in &def.values {
                        self.field(key.as_bytes());
                        self.field(&value.to_le_bytes());
                    }
                }
                None => self.field(name.as_bytes()),
            },
            other => self.field(other.name().as_bytes()),
        }
    }

    fn function(&mut self, name: &str, params: &[ParamDef], returns: &ValueType) {
        self.field(name.as_bytes());
        for param in params {
            self.field(param.name.as_bytes());
            self.ty(&param.ty);
        }
        self.ty(returns);
    }
}

/// Computes the signature of a capability map.
pub fn compute(map: &CapabilityMap) -> ObjectSignature {
    let mut h = SignatureHasher {
        sha: Sha256::new(),
        map,
    };
    h.field(map.type_name().as_bytes());

    for prop in map.properties() {
        h.field(prop.name.as_bytes());
        h.ty(&prop.ty);
        h.field(&[prop.modifier.tag()]);
    }

    // Derived notify signals and push methods are implied by the
    // properties above.
    for signal in map.signals().iter().filter(|s| s.property.is_none()) {
        h.function(&signal.name, &signal.params, &ValueType::Void);
    }
    for method in map.methods().iter().filter(|m| m.pushes.is_none()) {
        h.function(&method.name, &method.params, &method.returns);
    }

    ObjectSignature(h.sha.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PropertyModifier;

    fn base() -> crate::api::CapabilityMapBuilder {
        CapabilityMap::builder("Sensor")
            .enumeration("Unit", [("Celsius", 0), ("Kelvin", 1)])
            .property("reading", ValueType::Double, PropertyModifier::ReadOnly)
            .property("unit", ValueType::Enum("Unit".into()), PropertyModifier::ReadWrite)
            .signal("alarm", [("level", ValueType::Int)])
            .method("calibrate", [("offset", ValueType::Double)], ValueType::Bool)
    }

    #[test]
    fn test_independent_builds_are_bit_equal() {
        assert_eq!(base().build().signature(), base().build().signature());
    }

    #[test]
    fn test_changing_property_type_changes_signature() {
        let a = base().build();
        let b = CapabilityMap::builder("Sensor")
            .enumeration("Unit", [("Celsius", 0), ("Kelvin", 1)])
            .property("reading", ValueType::Int, PropertyModifier::ReadOnly)
            .property("unit", ValueType::Enum("Unit".into()), PropertyModifier::ReadWrite)
            .signal("alarm", [("level", ValueType::Int)])
            .method("calibrate", [("offset", ValueType::Double)], ValueType::Bool)
            .build();
        assert_ne!(a.signature(), b.signature());
    }

    #[test]
    fn test_changing_modifier_changes_signature() {
        let a = CapabilityMap::builder("T")
            .property("x", ValueType::Int, PropertyModifier::ReadOnly)
            .build();
        let b = CapabilityMap::builder("T")
            .property("x", ValueType::Int, PropertyModifier::ReadWrite)
            .build();
        assert_ne!(a.signature(), b.signature());
    }

    #[test]
    fn test_renumbering_enum_changes_signature() {
        let a = base().build();
        let b = CapabilityMap::builder("Sensor")
            .enumeration("Unit", [("Celsius", 0), ("Kelvin", 2)])
            .property("reading", ValueType::Double, PropertyModifier::ReadOnly)
            .property("unit", ValueType::Enum("Unit".into()), PropertyModifier::ReadWrite)
            .signal("alarm", [("level", ValueType::Int)])
            .method("calibrate", [("offset", ValueType::Double)], ValueType::Bool)
            .build();
        assert_ne!(a.signature(), b.signature());
    }

    #[test]
    fn test_enum_declaration_order_does_not_matter() {
        let a = CapabilityMap::builder("T")
            .enumeration("A", [("x", 0)])
            .enumeration("B", [("y", 1)])
            .property("a", ValueType::Enum("A".into()), PropertyModifier::ReadOnly)
            .build();
        let b = CapabilityMap::builder("T")
            .enumeration("B", [("y", 1)])
            .enumeration("A", [("x", 0)])
            .property("a", ValueType::Enum("A".into()), PropertyModifier::ReadOnly)
            .build();
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn test_adjacent_names_do_not_collide() {
        let a = CapabilityMap::builder("T")
            .property("ab", ValueType::Int, PropertyModifier::ReadOnly)
            .build();
        let b = CapabilityMap::builder("Ta")
            .property("b", ValueType::Int, PropertyModifier::ReadOnly)
            .build();
        assert_ne!(a.signature(), b.signature());
    }

    #[test]
    fn test_hex_round_trip() {
        let sig = base().build().signature();
        let text = sig.to_string();
        assert_eq!(text.len(), 64);
        assert_eq!(ObjectSignature::from_hex(&text), Some(sig));
        assert_eq!(ObjectSignature::from_hex("zz"), None);
    }
}
