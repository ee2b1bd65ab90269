//! Pipeline state and state export.

mod backend;
mod store;

pub use backend::{
    backend_from_config, ExportError, FileBackend, InMemoryBackend, StateBackend, StateExport, StateExporter,
};
pub use store::{NodeState, PipelineStateStore, StateSnapshot};
