//! State export backends.
//!
//! Handler cleanup hands its transient provisioning state to a
//! [`StateBackend`] through a [`StateExporter`] scoped to that one instance.

use crate::config::{InstanceId, StateBackendConfig};
use crate::errors::TaskError;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Failure to export state.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Writing the export failed.
    #[error("state export IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Encoding the export failed.
    #[error("state export encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<ExportError> for TaskError {
    fn from(err: ExportError) -> Self {
        Self::execution("StateExportError", err.to_string())
    }
}

/// One instance's exported state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateExport {
    /// Stack the instance belongs to.
    pub stack: String,
    /// The exporting instance.
    pub instance: InstanceId,
    /// Transient provisioning state.
    pub transient_state: Value,
    /// Outputs at the time of export.
    pub outputs: Value,
}

/// Destination for exported provisioning state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Persists one export.
    async fn export_state(&self, export: StateExport) -> Result<(), ExportError>;
}

/// Builds the backend named in `core.state_backend`.
#[must_use]
pub fn backend_from_config(config: &StateBackendConfig) -> Arc<dyn StateBackend> {
    match config {
        StateBackendConfig::Memory => Arc::new(InMemoryBackend::new()),
        StateBackendConfig::File { path } => Arc::new(FileBackend::new(path)),
    }
}

/// Keeps exports in memory.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    exports: RwLock<Vec<StateExport>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every export received.
    #[must_use]
    pub fn exports(&self) -> Vec<StateExport> {
        self.exports.read().clone()
    }

    /// Returns exports from one instance.
    #[must_use]
    pub fn exports_for(&self, instance: &InstanceId) -> Vec<StateExport> {
        self.exports
            .read()
            .iter()
            .filter(|e| &e.instance == instance)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StateBackend for InMemoryBackend {
    async fn export_state(&self, export: StateExport) -> Result<(), ExportError> {
        self.exports.write().push(export);
        Ok(())
    }
}

/// Writes `<stack>.<type>.<name>.json` files under a directory.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Creates a backend rooted at `dir`; the directory is created on first export.
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Returns the file an export is written to.
    #[must_use]
    pub fn path_for(&self, stack: &str, instance: &InstanceId) -> PathBuf {
        self.dir.join(format!("{stack}.{instance}.json"))
    }
}

#[async_trait]
impl StateBackend for FileBackend {
    async fn export_state(&self, export: StateExport) -> Result<(), ExportError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&export.stack, &export.instance);
        tokio::fs::write(&path, serde_json::to_vec_pretty(&export)?).await?;
        debug!(path = %path.display(), "Exported instance state");
        Ok(())
    }
}

/// A handler's view of the backend, fixed to its own stack and instance.
#[derive(Clone)]
pub struct StateExporter {
    backend: Arc<dyn StateBackend>,
    stack: String,
    instance: InstanceId,
}

impl StateExporter {
    /// Creates an exporter for one instance.
    #[must_use]
    pub fn new(backend: Arc<dyn StateBackend>, stack: impl Into<String>, instance: InstanceId) -> Self {
        Self {
            backend,
            stack: stack.into(),
            instance,
        }
    }

    /// Returns the instance this exporter writes for.
    #[must_use]
    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    /// Exports `transient_state` and `outputs`.
    pub async fn export(&self, transient_state: Value, outputs: Value) -> Result<(), ExportError> {
        self.backend
            .export_state(StateExport {
                stack: self.stack.clone(),
                instance: self.instance.clone(),
                transient_state,
                outputs,
            })
            .await
    }
}

impl std::fmt::Debug for StateExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateExporter")
            .field("stack", &self.stack)
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_records_exports() {
        let backend = Arc::new(InMemoryBackend::new());
        let id = InstanceId::new("shell", "hello");
        let exporter = StateExporter::new(backend.clone(), "homelab", id.clone());

        exporter
            .export(json!({"pid": 1}), json!({"hello_output": []}))
            .await
            .unwrap();

        let exports = backend.exports_for(&id);
        assert_eq!(exports.len(), 1);
        assert_eq!(exports[0].stack, "homelab");
        assert_eq!(exports[0].transient_state, json!({"pid": 1}));
    }

    #[tokio::test]
    async fn test_file_backend_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("state"));
        let id = InstanceId::new("terraform", "proxmox");

        backend
            .export_state(StateExport {
                stack: "homelab".to_string(),
                instance: id.clone(),
                transient_state: json!({"serial": 3}),
                outputs: json!({}),
            })
            .await
            .unwrap();

        let path = backend.path_for("homelab", &id);
        assert!(path.ends_with("homelab.terraform.proxmox.json"));
        let written: StateExport = serde_json::from_slice(&tokio::fs::read(path).await.unwrap()).unwrap();
        assert_eq!(written.transient_state, json!({"serial": 3}));
    }

    #[tokio::test]
    async fn test_exporter_propagates_backend_failure() {
        let mut backend = MockStateBackend::new();
        backend
            .expect_export_state()
            .times(1)
            .returning(|_| Err(ExportError::Io(std::io::Error::other("disk full"))));

        let exporter = StateExporter::new(Arc::new(backend), "s", InstanceId::new("shell", "x"));
        let err: TaskError = exporter.export(json!({}), json!({})).await.unwrap_err().into();
        assert_eq!(err.kind_name(), "StateExportError");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_file_exports_interleave_on_one_thread() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileBackend::new(dir.path().join("nested")));
        let exporters: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|name| StateExporter::new(backend.clone(), "lab", InstanceId::new("shell", name)))
            .collect();

        let results = futures::future::join_all(
            exporters
                .iter()
                .map(|e| e.export(json!({"n": e.instance().name()}), json!({}))),
        )
        .await;

        assert!(results.iter().all(Result::is_ok));
        for exporter in &exporters {
            assert!(backend.path_for("lab", exporter.instance()).exists());
        }
    }
}
