//! Last-known property values for replicas.
//!
//! A replica with a store restores its cache at construction, so it can
//! show something sensible before the source answers, and saves the cache
//! when released. Values are keyed by type name *and* signature: values
//! saved by an incompatible version of a type are never restored.

use std::collections::HashMap;

use parking_lot::Mutex;
use repliq_protocol::{ObjectSignature, Value};

/// Storage for replica property caches.
///
/// Implementations must be cheap to call from the node's processing task;
/// anything slow belongs behind a background writer.
pub trait PersistedStore: Send + Sync + 'static {
    fn save(&self, type_name: &str, signature: ObjectSignature, values: &[Value]);

    fn restore(&self, type_name: &str, signature: ObjectSignature) -> Option<Vec<Value>>;
}

/// An in-process [`PersistedStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(String, ObjectSignature), Vec<Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl PersistedStore for MemoryStore {
    fn save(&self, type_name: &str, signature: ObjectSignature, values: &[Value]) {
        tracing::debug!(type_name, count = values.len(), "persisting properties");
        self.entries
            .lock()
            .insert((type_name.to_string(), signature), values.to_vec());
    }

    fn restore(&self, type_name: &str, signature: ObjectSignature) -> Option<Vec<Value>> {
        self.entries
            .lock()
            .get(&(type_name.to_string(), signature))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use repliq_protocol::{CapabilityMap, PropertyModifier, ValueType};

    use super::*;

    fn signature(ty: ValueType) -> ObjectSignature {
        CapabilityMap::builder("T")
            .property("x", ty, PropertyModifier::ReadOnly)
            .build()
            .signature()
    }

    #[test]
    fn test_restore_returns_saved_values() {
        let store = MemoryStore::new();
        let sig = signature(ValueType::Int);
        store.save("T", sig, &[Value::Int(4)]);
        assert_eq!(store.restore("T", sig), Some(vec![Value::Int(4)]));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_restore_ignores_other_signature() {
        let store = MemoryStore::new();
        store.save("T", signature(ValueType::Int), &[Value::Int(4)]);
        assert_eq!(store.restore("T", signature(ValueType::String)), None);
        assert_eq!(store.restore("U", signature(ValueType::Int)), None);
    }
}
