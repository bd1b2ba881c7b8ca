// ── Per-device batch buffer ──

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

/// Property name → latest value, ordered by last write.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Batch {
    values: IndexMap<String, Value>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// A batch holding a single value.
    pub fn single(property: impl Into<String>, value: Value) -> Self {
        let mut batch = Self::new();
        batch.upsert(property, value);
        batch
    }

    /// Insert or overwrite `property`, moving it to the end.
    pub fn upsert(&mut self, property: impl Into<String>, value: Value) {
        let property = property.into();
        self.values.shift_remove(&property);
        self.values.insert(property, value);
    }

    pub fn get(&self, property: &str) -> Option<&Value> {
        self.values.get(property)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// The batch as a JSON object, preserving order.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}
