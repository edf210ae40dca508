use derive_more::From;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque, backend-specific option bag carried by each job.
///
/// Adapters read the keys they understand and ignore everything else.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, From)]
#[serde(transparent)]
pub struct BackendOptions(Map<String, Value>);

impl BackendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// A single string is treated as a one element list, non-string items are skipped.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        match self.0.get(key) {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn flag(&self, key: &str) -> bool {
        self.0.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// `keep_*` entries with a positive count, sorted by key.
    pub fn keep_counts(&self) -> Vec<(&str, u64)> {
        let mut keeps: Vec<_> = self
            .0
            .iter()
            .filter(|(k, _)| k.starts_with("keep_"))
            .filter_map(|(k, v)| v.as_u64().filter(|n| *n > 0).map(|n| (k.as_str(), n)))
            .collect();
        keeps.sort_unstable();
        keeps
    }
}
