use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};

/// Shared key/value state threaded through every node of a flow run.
///
/// Workflow state lives in `data`; `metadata` carries flow bookkeeping such
/// as the step counter and the step-limit marker.
#[derive(Debug, Clone, Default)]
pub struct Context {
    data: HashMap<String, Value>,
    metadata: HashMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.data.insert(key.to_string(), value);
    }

    pub fn set_metadata(&mut self, key: &str, value: Value) {
        self.metadata.insert(key.to_string(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Reads `key` as a typed value. A missing key or an explicit JSON null
    /// both yield `Ok(None)`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.data.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| Error::Context(format!("key '{}' has an unexpected shape: {}", key, e))),
        }
    }

    /// Like [`Context::get_as`] but a missing key is an error.
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.get_as(key)?
            .ok_or_else(|| Error::Context(format!("missing required key '{}'", key)))
    }

    pub fn set_as<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, value);
        Ok(())
    }

    pub fn get_usize(&self, key: &str) -> usize {
        self.get(key)
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(0)
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Context {{")?;

        writeln!(f, "  data: {{")?;
        for (key, value) in &self.data {
            writeln!(f, "    \"{}\": {},", key, value)?;
        }
        writeln!(f, "  }},")?;

        writeln!(f, "  metadata: {{")?;
        for (key, value) in &self.metadata {
            writeln!(f, "    \"{}\": {},", key, value)?;
        }
        writeln!(f, "  }}")?;

        write!(f, "}}")
    }
}
