//! Bookkeeping shared by handler implementations.

use crate::state::{ExportError, StateExporter};
use serde_json::{Map, Value};

/// Transient state and grouped outputs of one handler.
///
/// Outputs are grouped lists: every [`export_output`](Self::export_output)
/// under the same name appends, so a group reference can later select an
/// element by position or by its `name` field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskState {
    state: Map<String, Value>,
    outputs: Map<String, Value>,
}

impl TaskState {
    /// Creates empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a transient state entry.
    pub fn set_state(&mut self, key: impl Into<String>, value: Value) {
        self.state.insert(key.into(), value);
    }

    /// Returns the transient state.
    #[must_use]
    pub fn state(&self) -> &Map<String, Value> {
        &self.state
    }

    /// Appends `value` to the output group `name`.
    pub fn export_output(&mut self, name: impl Into<String>, value: Value) {
        let slot = self
            .outputs
            .entry(name.into())
            .or_insert_with(|| Value::Array(Vec::new()));
        match slot {
            Value::Array(items) => items.push(value),
            other => {
                let previous = std::mem::take(other);
                *other = Value::Array(vec![previous, value]);
            }
        }
    }

    /// Returns the output groups.
    #[must_use]
    pub fn outputs(&self) -> &Map<String, Value> {
        &self.outputs
    }

    /// Drops every output group. Transient state is left untouched.
    pub fn clear_outputs(&mut self) {
        self.outputs.clear();
    }

    /// Exports state and outputs, then clears the transient state.
    pub async fn export_final(&mut self, exporter: &StateExporter) -> Result<(), ExportError> {
        exporter
            .export(Value::Object(self.state.clone()), Value::Object(self.outputs.clone()))
            .await?;
        self.state.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceId;
    use crate::state::InMemoryBackend;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_export_output_appends() {
        let mut state = TaskState::new();
        state.export_output("build_output", json!({"exit_code": 0}));
        state.export_output("build_output", json!({"exit_code": 1}));
        assert_eq!(
            state.outputs().get("build_output"),
            Some(&json!([{"exit_code": 0}, {"exit_code": 1}]))
        );
    }

    #[tokio::test]
    async fn test_export_final_clears_state_keeps_outputs() {
        let backend = Arc::new(InMemoryBackend::new());
        let id = InstanceId::new("shell", "build");
        let exporter = StateExporter::new(backend.clone(), "stack", id.clone());

        let mut state = TaskState::new();
        state.set_state("resources", json!(["command.build.0000abcd"]));
        state.export_output("build_output", json!("ok"));
        state.export_final(&exporter).await.unwrap();

        assert!(state.state().is_empty());
        assert_eq!(state.outputs().len(), 1);

        let exports = backend.exports_for(&id);
        assert_eq!(exports[0].transient_state, json!({"resources": ["command.build.0000abcd"]}));
        assert_eq!(exports[0].outputs, json!({"build_output": ["ok"]}));
    }
}
