//! # Pipeline Orchestrator
//!
//! Runs a declarative pipeline of infrastructure tasks.
//!
//! A pipeline document names one pipeline and lists instances grouped by
//! task type. Instances may reference each other's outputs and secret
//! values through tokens embedded in their configuration:
//!
//! - `_secret:<vault>:<dot.path>` reads a value from a declared vault
//! - `_group:<type>:<instance>:<group>[:<node>]` reads an output group of an
//!   earlier instance
//!
//! The orchestrator derives a dependency graph from those tokens, rejects
//! cycles before anything runs, then executes every instance in its own
//! sandbox with retries, as soon as its dependencies have succeeded.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pipeline_orchestrator::prelude::*;
//!
//! let catalog = PackageCatalog::new().with_package(shell_package());
//! let orchestrator = load_orchestrator("pipeline.yaml", &catalog)?
//!     .with_event_sink(Arc::new(LoggingEventSink::info()));
//!
//! let report = orchestrator.run(Arc::new(CancellationToken::new())).await;
//! std::process::exit(report.exit_code());
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, missing_docs, rust_2018_idioms)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod bootstrap;
pub mod cancellation;
pub mod config;
pub mod errors;
pub mod events;
pub mod handler;
pub mod pipeline;
pub mod reference;
pub mod registry;
pub mod state;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bootstrap::{load_orchestrator, orchestrator_for};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{
        BlastRadius, CoreSettings, InstanceId, InstanceSpec, IsolationDescriptor, IsolationKind, PipelineSpec,
        RetryPolicy, TaskType,
    };
    pub use crate::errors::{
        ConfigError, CycleDetectedError, ExecutionError, IsolationError, LoaderError, OrchestratorError,
        ReferenceError, StateError, TaskError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::handler::{Sandbox, TaskHandler, TaskInit, TaskOutputs, TaskState};
    pub use crate::pipeline::{ExecutionGraph, NodeStatus, Orchestrator, PipelineReport};
    pub use crate::registry::{PackageCatalog, TaskPackage, TaskRegistry};
    pub use crate::state::{StateBackend, StateExporter};
}
