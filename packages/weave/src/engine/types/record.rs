use super::path::FieldPath;
use super::value::FieldValue;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;
use std::hash::BuildHasherDefault;

/// Entity identifier. SmolStr inlines typical ids without heap allocation.
pub type RowKey = SmolStr;

pub type FastMap<K, V> = std::collections::HashMap<K, V, BuildHasherDefault<FxHasher>>;

/// A full document as delivered by the backing store.
///
/// Records are replaced wholesale on every update; the aggregator never
/// merges at field level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RowKey,
    pub fields: FieldValue,
}

impl Record {
    pub fn new(id: impl Into<RowKey>, fields: FieldValue) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Build a record from raw JSON, as received off the wire.
    pub fn from_json(id: impl Into<RowKey>, fields: Value) -> Self {
        Self::new(id, FieldValue::from(fields))
    }

    /// Resolve a nested field by dot path.
    pub fn field(&self, path: &FieldPath) -> Option<&FieldValue> {
        let mut current = Some(&self.fields);
        for part in path.segments() {
            match current {
                Some(FieldValue::Object(map)) => current = map.get(part),
                _ => return None,
            }
        }
        current
    }
}
