//! Variable map used for flow variables, node outputs and trigger payloads.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

/// An ordered JSON object with typed accessors.
///
/// Merging with [`Vars::extend`] is last-write-wins on overlapping keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Vars(Map<String, Value>);

impl Vars {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder-style insert.
    pub fn with<T: Serialize>(
        mut self,
        key: &str,
        value: T,
    ) -> Self {
        self.set(key, value);
        self
    }

    pub fn set<T: Serialize>(
        &mut self,
        key: &str,
        value: T,
    ) {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.0.insert(key.to_string(), value);
    }

    /// Deserializes the value stored under `key`.
    pub fn get<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Option<T> {
        self.0.get(key).and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_value(
        &self,
        key: &str,
    ) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(
        &self,
        key: &str,
    ) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Resolves a dotted path such as `order.items.0.sku`.
    pub fn lookup(
        &self,
        path: &str,
    ) -> Option<&Value> {
        if let Some(v) = self.0.get(path) {
            return Some(v);
        }

        let mut parts = path.split('.');
        let mut current = self.0.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(arr) => arr.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn contains(
        &self,
        key: &str,
    ) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(
        &mut self,
        key: &str,
    ) -> Option<Value> {
        self.0.remove(key)
    }

    /// Merges `other` into `self`, overwriting existing keys.
    pub fn extend(
        &mut self,
        other: Vars,
    ) {
        for (k, v) in other.0 {
            self.0.insert(k, v);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }
}

impl From<Value> for Vars {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self::new(),
        }
    }
}

impl From<Vars> for Value {
    fn from(vars: Vars) -> Self {
        Value::Object(vars.0)
    }
}

impl FromIterator<(String, Value)> for Vars {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
