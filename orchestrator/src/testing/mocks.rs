//! Mock task handlers for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use semver::Version;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::TaskError;
use crate::handler::{TaskHandler, TaskInit, TaskOutputs, TaskState};
use crate::registry::{TaskPackage, PACKAGE_PREFIX};
use crate::state::StateExporter;

/// A handler lifecycle call seen by a [`TaskRecorder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// `initialize` was called.
    Initialize,
    /// An `execute` attempt began.
    ExecuteStarted,
    /// An `execute` attempt returned.
    ExecuteFinished,
    /// `cleanup` was called.
    Cleanup,
}

#[derive(Debug, Default)]
struct Concurrency {
    active: usize,
    peak: usize,
}

/// Records lifecycle calls across every [`MockTask`] it built.
///
/// Calls are keyed by instance name.
#[derive(Debug, Default)]
pub struct TaskRecorder {
    calls: Mutex<Vec<(String, Phase)>>,
    configs: Mutex<BTreeMap<String, Value>>,
    concurrency: Mutex<Concurrency>,
}

impl TaskRecorder {
    /// Creates a shared recorder.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Builds a package for `type_name` whose handlers report to this recorder.
    #[must_use]
    pub fn package(self: &Arc<Self>, type_name: &str) -> TaskPackage {
        let recorder = Arc::clone(self);
        TaskPackage::new(
            format!("{PACKAGE_PREFIX}{}", type_name.replace('_', "-")),
            Version::new(0, 1, 0),
            move || Box::new(MockTask::with_recorder(Arc::clone(&recorder))),
        )
    }

    fn record(&self, instance: &str, phase: Phase) {
        self.calls.lock().push((instance.to_string(), phase));
    }

    fn enter(&self) {
        let mut c = self.concurrency.lock();
        c.active += 1;
        c.peak = c.peak.max(c.active);
    }

    fn exit(&self) {
        let mut c = self.concurrency.lock();
        c.active = c.active.saturating_sub(1);
    }

    /// Returns every recorded call in order.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, Phase)> {
        self.calls.lock().clone()
    }

    /// Counts calls of `phase` for `instance`.
    #[must_use]
    pub fn count(&self, instance: &str, phase: Phase) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(i, p)| i == instance && *p == phase)
            .count()
    }

    /// Position of the first `phase` call for `instance`.
    #[must_use]
    pub fn position(&self, instance: &str, phase: Phase) -> Option<usize> {
        self.calls
            .lock()
            .iter()
            .position(|(i, p)| i == instance && *p == phase)
    }

    /// Instances in the order their first `execute` began.
    #[must_use]
    pub fn execution_order(&self) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        for (instance, phase) in self.calls.lock().iter() {
            if *phase == Phase::ExecuteStarted && !order.contains(instance) {
                order.push(instance.clone());
            }
        }
        order
    }

    /// The resolved configuration `instance` was initialized with.
    #[must_use]
    pub fn config_of(&self, instance: &str) -> Option<Value> {
        self.configs.lock().get(instance).cloned()
    }

    /// The most `execute` calls that were in flight at once.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.concurrency.lock().peak
    }
}

/// Behaviour read from a [`MockTask`]'s resolved config.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct MockBehaviour {
    fail_attempts: u32,
    always_fail: bool,
    error_kind: Option<String>,
    sleep_ms: u64,
    init_sleep_ms: u64,
    outputs: Map<String, Value>,
    fail_initialize: bool,
    fail_cleanup: bool,
}

/// A handler scripted by its own configuration.
///
/// Recognised keys, all optional: `fail_attempts` (the first N executes
/// fail), `always_fail`, `error_kind` (default `ConnectionError`),
/// `sleep_ms`, `init_sleep_ms` (delay inside `initialize`), `outputs`
/// (groups to export; list values export each element), `fail_initialize`,
/// `fail_cleanup`. Other keys are ignored.
#[derive(Debug)]
pub struct MockTask {
    recorder: Arc<TaskRecorder>,
    name: String,
    behaviour: MockBehaviour,
    state: TaskState,
    executions: u32,
}

impl Default for MockTask {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTask {
    /// Creates a mock with its own recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::with_recorder(TaskRecorder::new())
    }

    /// Creates a mock reporting to `recorder`.
    #[must_use]
    pub fn with_recorder(recorder: Arc<TaskRecorder>) -> Self {
        Self {
            recorder,
            name: String::new(),
            behaviour: MockBehaviour::default(),
            state: TaskState::new(),
            executions: 0,
        }
    }

    /// Returns the recorder.
    #[must_use]
    pub fn recorder(&self) -> &Arc<TaskRecorder> {
        &self.recorder
    }
}

#[async_trait]
impl TaskHandler for MockTask {
    async fn initialize(&mut self, init: TaskInit) -> Result<(), TaskError> {
        self.name = init.name;
        self.recorder.record(&self.name, Phase::Initialize);
        self.recorder.configs.lock().insert(self.name.clone(), init.config.clone());

        self.behaviour = serde_json::from_value(init.config)
            .map_err(|e| TaskError::invalid_config(format!("mock config: {e}")))?;
        if self.behaviour.init_sleep_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.behaviour.init_sleep_ms)).await;
        }
        if self.behaviour.fail_initialize {
            return Err(TaskError::invalid_config("configured to fail initialization"));
        }
        Ok(())
    }

    async fn execute(&mut self) -> Result<TaskOutputs, TaskError> {
        self.executions += 1;
        let attempt = self.executions;
        self.recorder.record(&self.name, Phase::ExecuteStarted);

        self.recorder.enter();
        if self.behaviour.sleep_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.behaviour.sleep_ms)).await;
        }
        self.recorder.exit();
        self.recorder.record(&self.name, Phase::ExecuteFinished);

        if self.behaviour.always_fail || attempt <= self.behaviour.fail_attempts {
            let kind = self.behaviour.error_kind.as_deref().unwrap_or("ConnectionError");
            return Err(TaskError::execution(kind, format!("attempt {attempt} failed")));
        }

        for (group, value) in &self.behaviour.outputs {
            match value {
                Value::Array(items) => {
                    for item in items {
                        self.state.export_output(group.clone(), item.clone());
                    }
                }
                other => self.state.export_output(group.clone(), other.clone()),
            }
        }
        self.state.set_state("resource", json!(format!("mock.{}", self.name)));

        Ok(TaskOutputs::new()
            .with_outputs(self.state.outputs().clone())
            .with_transient_state(self.state.state().clone()))
    }

    fn get_output_data(&self) -> Map<String, Value> {
        self.state.outputs().clone()
    }

    async fn cleanup(&mut self, exporter: &StateExporter) -> Result<(), TaskError> {
        self.recorder.record(&self.name, Phase::Cleanup);
        if self.behaviour.fail_cleanup {
            return Err(TaskError::execution("ExportError", "configured to fail cleanup"));
        }
        self.state.export_final(exporter).await?;
        Ok(())
    }
}

/// A handler whose `execute` fails with a fixed error kind.
#[derive(Debug)]
pub struct FailingTask {
    kind: String,
    succeed_after: Option<u32>,
    hang: bool,
    executions: u32,
}

impl FailingTask {
    /// Creates a handler that always fails with `kind`.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            succeed_after: None,
            hang: false,
            executions: 0,
        }
    }

    /// Succeeds once `failures` attempts have failed.
    #[must_use]
    pub fn succeeding_after(mut self, failures: u32) -> Self {
        self.succeed_after = Some(failures);
        self
    }

    /// Never returns from `execute`.
    #[must_use]
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Number of `execute` calls so far.
    #[must_use]
    pub fn executions(&self) -> u32 {
        self.executions
    }
}

#[async_trait]
impl TaskHandler for FailingTask {
    async fn initialize(&mut self, _init: TaskInit) -> Result<(), TaskError> {
        Ok(())
    }

    async fn execute(&mut self) -> Result<TaskOutputs, TaskError> {
        self.executions += 1;
        if self.hang {
            std::future::pending::<()>().await;
        }
        match self.succeed_after {
            Some(failures) if self.executions > failures => Ok(TaskOutputs::new()),
            _ => Err(TaskError::execution(
                self.kind.clone(),
                format!("attempt {} failed", self.executions),
            )),
        }
    }

    fn get_output_data(&self) -> Map<String, Value> {
        Map::new()
    }

    async fn cleanup(&mut self, _exporter: &StateExporter) -> Result<(), TaskError> {
        Ok(())
    }
}
