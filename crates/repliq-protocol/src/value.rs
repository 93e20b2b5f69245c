//! Typed values carried by properties, signal arguments, method arguments
//! and model cells.
//!
//! [`Value`] is a closed tagged union over every type a capability map can
//! declare. [`ValueType`] is the matching type id: capability maps record
//! one per property/parameter, the signature hasher hashes its name, and
//! replicas use [`ValueType::default_value`] for placeholders.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A dynamically typed value from a closed set of wire types.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    /// No value: the default placeholder and the result of void methods.
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Returns `true` for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view. `UInt` values that fit are converted.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::UInt(u) => Some(*u),
            Self::Int(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Double(d) => Some(*d),
            Self::Int(i) => Some(*i as f64),
            Self::UInt(u) => Some(*u as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Short name of the variant, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::UInt(_) => "uint",
            Self::Double(_) => "double",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::UInt(u) => write!(f, "{u}"),
            Self::Double(d) => write!(f, "{d}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Map(map) => {
                f.write_str("{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k:?}: {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::UInt(v.into())
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Self::Map(v)
    }
}

// ---------------------------------------------------------------------------
// ValueType
// ---------------------------------------------------------------------------

/// The declared type of a property, parameter or return value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    /// Method returns nothing.
    Void,
    /// Accepts any value (dynamic slots).
    Any,
    Bool,
    Int,
    UInt,
    Double,
    String,
    Bytes,
    List,
    Map,
    /// An enum declared in the capability map; carried as `Value::Int`.
    Enum(String),
    /// A child object hosted as its own source; the value is its name.
    Object(String),
    /// A data model hosted as its own model source; the value is its name.
    Model,
}

impl ValueType {
    /// The type name hashed into signatures.
    pub fn name(&self) -> &str {
        match self {
            Self::Void => "void",
            Self::Any => "any",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::UInt => "uint",
            Self::Double => "double",
            Self::String => "string",
            Self::Bytes => "bytes",
            Self::List => "list",
            Self::Map => "map",
            Self::Enum(name) | Self::Object(name) => name,
            Self::Model => "model",
        }
    }

    /// The value a replica reports before (or instead of) real data.
    pub fn default_value(&self) -> Value {
        match self {
            Self::Void | Self::Any | Self::Object(_) | Self::Model => Value::Null,
            Self::Bool => Value::Bool(false),
            Self::Int | Self::Enum(_) => Value::Int(0),
            Self::UInt => Value::UInt(0),
            Self::Double => Value::Double(0.0),
            Self::String => Value::String(String::new()),
            Self::Bytes => Value::Bytes(Vec::new()),
            Self::List => Value::List(Vec::new()),
            Self::Map => Value::Map(BTreeMap::new()),
        }
    }

    /// Returns `true` if `value` may be stored in a slot of this type.
    /// `Null` is accepted everywhere so defaults can always be written.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) | (Self::Any, _) => true,
            (Self::Bool, Value::Bool(_)) => true,
            (Self::Int | Self::Enum(_), Value::Int(_)) => true,
            (Self::UInt, Value::UInt(_)) => true,
            (Self::Double, Value::Double(_) | Value::Int(_)) => true,
            (Self::String | Self::Object(_) | Self::Model, Value::String(_)) => true,
            (Self::Bytes, Value::Bytes(_)) => true,
            (Self::List, Value::List(_)) => true,
            (Self::Map, Value::Map(_)) => true,
            _ => false,
        }
    }

    /// Returns `true` for child-object and model slots.
    pub fn is_child(&self) -> bool {
        matches!(self, Self::Object(_) | Self::Model)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_default_is_null() {
        assert_eq!(Value::default(), Value::Null);
        assert!(Value::default().is_null());
    }

    #[test]
    fn test_value_accessors_convert_integers() {
        assert_eq!(Value::UInt(7).as_i64(), Some(7));
        assert_eq!(Value::Int(-1).as_u64(), None);
        assert_eq!(Value::Int(3).as_f64(), Some(3.0));
        assert_eq!(Value::from("x").as_str(), Some("x"));
        assert_eq!(Value::Bool(true).as_i64(), None);
    }

    #[test]
    fn test_value_display_nested() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), Value::List(vec![1.into(), "b".into()]));
        assert_eq!(Value::Map(map).to_string(), r#"{"a": [1, "b"]}"#);
    }

    #[test]
    fn test_value_type_default_values_are_accepted() {
        let types = [
            ValueType::Bool,
            ValueType::Int,
            ValueType::UInt,
            ValueType::Double,
            ValueType::String,
            ValueType::Bytes,
            ValueType::List,
            ValueType::Map,
            ValueType::Enum("Mode".into()),
        ];
        for ty in types {
            assert!(ty.accepts(&ty.default_value()), "{ty} rejects its default");
        }
    }

    #[test]
    fn test_value_type_rejects_mismatched_value() {
        assert!(!ValueType::Int.accepts(&Value::from("nope")));
        assert!(!ValueType::Bool.accepts(&Value::Int(1)));
        assert!(ValueType::Any.accepts(&Value::Bytes(vec![1])));
        assert!(ValueType::Int.accepts(&Value::Null));
    }

    #[test]
    fn test_value_type_name_for_enum_is_enum_name() {
        assert_eq!(ValueType::Enum("Mode".into()).name(), "Mode");
        assert_eq!(ValueType::Model.name(), "model");
        assert!(ValueType::Model.is_child());
        assert!(!ValueType::Int.is_child());
    }
}
