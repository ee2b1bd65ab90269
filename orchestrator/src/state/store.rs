//! The pipeline state store.
//!
//! A single table of per-instance outputs and transient provisioning state.
//! The scheduler owns the only mutable handle; every reader works from an
//! immutable [`StateSnapshot`], so no reader ever observes a half-written
//! record.

use crate::config::InstanceId;
use crate::errors::StateError;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Stored result of one succeeded instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    /// Durable outputs, kept for the whole run.
    pub outputs: Map<String, Value>,
    /// Provisioning state, cleared once cleanup has exported it.
    pub transient_state: Map<String, Value>,
    /// The attempt that produced the outputs.
    pub attempt: u32,
}

/// An immutable view of the store at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateSnapshot {
    entries: Arc<BTreeMap<InstanceId, NodeState>>,
}

impl StateSnapshot {
    /// Returns the record for an instance.
    #[must_use]
    pub fn get(&self, id: &InstanceId) -> Option<&NodeState> {
        self.entries.get(id)
    }

    /// Returns the outputs of an instance.
    #[must_use]
    pub fn outputs(&self, id: &InstanceId) -> Option<&Map<String, Value>> {
        self.entries.get(id).map(|s| &s.outputs)
    }

    /// Returns true if the instance has a record.
    #[must_use]
    pub fn contains(&self, id: &InstanceId) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no instance has succeeded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates records in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&InstanceId, &NodeState)> {
        self.entries.iter()
    }
}

impl Serialize for StateSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (id, state) in self.entries.iter() {
            map.serialize_entry(id, state)?;
        }
        map.end()
    }
}

/// Owner-side handle on pipeline state.
#[derive(Debug, Default)]
pub struct PipelineStateStore {
    entries: Arc<BTreeMap<InstanceId, NodeState>>,
}

impl PipelineStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the result of an instance's successful attempt.
    ///
    /// Each instance is written once; a second write is an orchestrator bug.
    pub fn store(
        &mut self,
        id: &InstanceId,
        attempt: u32,
        outputs: Map<String, Value>,
        transient_state: Map<String, Value>,
    ) -> Result<(), StateError> {
        if let Some(existing) = self.entries.get(id) {
            return Err(StateError::new(format!(
                "outputs already stored by attempt {}; refusing write from attempt {attempt}",
                existing.attempt
            ))
            .with_instance(id.to_string()));
        }
        Arc::make_mut(&mut self.entries).insert(
            id.clone(),
            NodeState {
                outputs,
                transient_state,
                attempt,
            },
        );
        Ok(())
    }

    /// Drops an instance's transient state, keeping its outputs.
    pub fn clear_transient(&mut self, id: &InstanceId) -> Result<(), StateError> {
        let entries = Arc::make_mut(&mut self.entries);
        let state = entries
            .get_mut(id)
            .ok_or_else(|| StateError::new("no stored record to clear").with_instance(id.to_string()))?;
        state.transient_state.clear();
        Ok(())
    }

    /// Returns a read-only view of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            entries: Arc::clone(&self.entries),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(m) => m,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_store_and_snapshot() {
        let mut store = PipelineStateStore::new();
        let id = InstanceId::new("terraform", "proxmox");
        store
            .store(&id, 1, map(json!({"master": []})), map(json!({"tfstate": "x"})))
            .unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.outputs(&id), Some(&map(json!({"master": []}))));
    }

    #[test]
    fn test_duplicate_write_is_state_error() {
        let mut store = PipelineStateStore::new();
        let id = InstanceId::new("shell", "hello");
        store.store(&id, 1, Map::new(), Map::new()).unwrap();
        let err = store.store(&id, 2, Map::new(), Map::new()).unwrap_err();
        assert_eq!(err.instance.as_deref(), Some("shell.hello"));
    }

    #[test]
    fn test_snapshot_is_stable_across_writes() {
        let mut store = PipelineStateStore::new();
        let a = InstanceId::new("shell", "a");
        let b = InstanceId::new("shell", "b");
        store.store(&a, 1, Map::new(), map(json!({"k": 1}))).unwrap();

        let before = store.snapshot();
        store.store(&b, 1, Map::new(), Map::new()).unwrap();
        store.clear_transient(&a).unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(before.get(&a).map(|s| s.transient_state.len()), Some(1));

        let after = store.snapshot();
        assert_eq!(after.len(), 2);
        assert!(after.get(&a).is_some_and(|s| s.transient_state.is_empty()));
    }

    #[test]
    fn test_clear_transient_unknown_instance() {
        let mut store = PipelineStateStore::new();
        assert!(store.clear_transient(&InstanceId::new("shell", "x")).is_err());
    }

    #[test]
    fn test_snapshot_serializes_by_qualified_id() {
        let mut store = PipelineStateStore::new();
        store
            .store(&InstanceId::new("shell", "a"), 2, map(json!({"g": [1]})), Map::new())
            .unwrap();
        let json = serde_json::to_value(store.snapshot()).unwrap();
        assert_eq!(json["shell.a"]["attempt"], json!(2));
        assert_eq!(json["shell.a"]["outputs"]["g"], json!([1]));
    }
}
