//
// store.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use std::collections::HashMap;

use serde_json::Value;

use crate::error::ClientError;

/// Values fetched from the kernel, keyed by the name they were requested
/// under. Lookups of names that were never stored fail with
/// `ClientError::KeyNotFound`.
#[derive(Debug, Default, Clone)]
pub struct VariableStore {
    values: HashMap<String, Value>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Result<&Value, ClientError> {
        self.values
            .get(name)
            .ok_or_else(|| ClientError::KeyNotFound(name.to_string()))
    }

    /// Store a value, returning the one it replaced.
    pub fn set(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(name.into(), value)
    }

    pub fn delete(&mut self, name: &str) -> Result<Value, ClientError> {
        self.values
            .remove(name)
            .ok_or_else(|| ClientError::KeyNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// The stored names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.values.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
