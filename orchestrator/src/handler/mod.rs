//! The task handler contract.
//!
//! Every task type implements [`TaskHandler`]. The scheduler drives each
//! instance through `initialize`, `execute` (via the retry engine),
//! `get_output_data` and `cleanup`, in that order, and never hands a handler
//! anything but its own resolved configuration, sandbox and exporter.

mod isolation;
mod lifecycle;
mod task_state;

pub use isolation::{sandbox_for, CommandOutput, ContainerSandbox, HostSandbox, Sandbox};
pub use lifecycle::{HandlerLifecycle, HandlerState};
pub use task_state::TaskState;

use crate::errors::TaskError;
use crate::state::StateExporter;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Everything a handler receives at initialization.
#[derive(Debug, Clone)]
pub struct TaskInit {
    /// Instance name.
    pub name: String,
    /// Configuration with every reference token substituted.
    pub config: Value,
    /// `<stack>.<type>.<name>`.
    pub stack_identifier: String,
    /// The sandbox `execute` must run in.
    pub sandbox: Arc<dyn Sandbox>,
}

/// What one successful `execute()` produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutputs {
    /// Output groups from this attempt.
    pub outputs: Map<String, Value>,
    /// Provisioning state for cleanup to export.
    pub transient_state: Map<String, Value>,
}

impl TaskOutputs {
    /// Creates empty outputs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps output groups.
    #[must_use]
    pub fn with_outputs(mut self, outputs: Map<String, Value>) -> Self {
        self.outputs = outputs;
        self
    }

    /// Sets the transient state.
    #[must_use]
    pub fn with_transient_state(mut self, state: Map<String, Value>) -> Self {
        self.transient_state = state;
        self
    }
}

/// A task type implementation.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Validates the resolved config and prepares, without starting, execution.
    async fn initialize(&mut self, init: TaskInit) -> Result<(), TaskError>;

    /// Runs the task inside its sandbox.
    ///
    /// May be called again after a retryable failure.
    async fn execute(&mut self) -> Result<TaskOutputs, TaskError>;

    /// Returns the durable outputs to store. Must be side-effect free.
    fn get_output_data(&self) -> Map<String, Value>;

    /// Exports transient state through `exporter` and clears it.
    ///
    /// Called exactly once for every handler that initialized, whatever
    /// `execute` returned.
    async fn cleanup(&mut self, exporter: &StateExporter) -> Result<(), TaskError>;
}
