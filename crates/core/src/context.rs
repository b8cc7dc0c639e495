//! Per-request call context.
//!
//! A read-only key → value map threaded through one pipeline execution.
//! It is assembled at the entry point and then only ever shared; tools that
//! need caller identity (e.g. the helpdesk user) read it from here.

use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallContext {
    entries: Arc<HashMap<String, serde_json::Value>>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder step: a copy of this context with one more entry.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Arc::make_mut(&mut self.entries).insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.entries.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
