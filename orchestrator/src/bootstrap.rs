//! Load-time wiring from a document to a runnable orchestrator.

use crate::config::PipelineSpec;
use crate::errors::OrchestratorError;
use crate::pipeline::Orchestrator;
use crate::registry::{PackageCatalog, TaskRegistry};
use std::path::Path;
use tracing::info;

/// Loads task types for `spec` from `catalog` and builds the orchestrator.
///
/// Every failure here happens before any node runs.
pub fn orchestrator_for(spec: PipelineSpec, catalog: &PackageCatalog) -> Result<Orchestrator, OrchestratorError> {
    let registry = TaskRegistry::load(catalog, spec.task_types())?;
    let orchestrator = Orchestrator::new(spec, registry)?;
    info!(
        pipeline = %orchestrator.spec().name,
        nodes = orchestrator.graph().len(),
        "Pipeline loaded"
    );
    Ok(orchestrator)
}

/// Reads the document at `path` and builds the orchestrator.
pub fn load_orchestrator(path: impl AsRef<Path>, catalog: &PackageCatalog) -> Result<Orchestrator, OrchestratorError> {
    orchestrator_for(PipelineSpec::from_path(path)?, catalog)
}
