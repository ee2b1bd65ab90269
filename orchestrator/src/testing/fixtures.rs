//! Pipeline document fixtures.

use serde_json::Value;
use serde_yaml::{Mapping, Value as YamlValue};
use std::sync::Arc;

use super::clock::RecordingClock;
use super::mocks::TaskRecorder;
use crate::config::PipelineSpec;
use crate::errors::{ConfigError, OrchestratorError};
use crate::pipeline::Orchestrator;
use crate::registry::{PackageCatalog, TaskRegistry};

/// Builds a pipeline document section by section.
///
/// Every task type gets a [`MockTask`](super::MockTask) package reporting to
/// the fixture's [`TaskRecorder`]; retries use a [`RecordingClock`].
#[derive(Debug)]
pub struct PipelineFixture {
    name: String,
    core: Mapping,
    secrets: Vec<YamlValue>,
    sections: Vec<(String, Vec<YamlValue>)>,
    recorder: Arc<TaskRecorder>,
    clock: Arc<RecordingClock>,
}

impl PipelineFixture {
    /// Creates an empty pipeline called `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            core: Mapping::new(),
            secrets: Vec::new(),
            sections: Vec::new(),
            recorder: TaskRecorder::new(),
            clock: Arc::new(RecordingClock::new()),
        }
    }

    /// Sets a `core` key.
    #[must_use]
    pub fn with_core(mut self, key: &str, value: Value) -> Self {
        self.core.insert(YamlValue::from(key), to_yaml(&value));
        self
    }

    /// Declares a vault.
    #[must_use]
    pub fn with_vault(mut self, name: &str, data: Value) -> Self {
        let mut entry = Mapping::new();
        entry.insert(YamlValue::from("name"), YamlValue::from(name));
        if let YamlValue::Mapping(fields) = to_yaml(&data) {
            entry.extend(fields);
        }
        self.secrets.push(YamlValue::Mapping(entry));
        self
    }

    /// Appends an instance to the `task_type` section, creating the section
    /// on first use.
    #[must_use]
    pub fn with_instance(mut self, task_type: &str, instance: Value) -> Self {
        let instance = to_yaml(&instance);
        match self.sections.iter_mut().find(|(t, _)| t == task_type) {
            Some((_, instances)) => instances.push(instance),
            None => self.sections.push((task_type.to_string(), vec![instance])),
        }
        self
    }

    /// Returns the recorder shared by every mock handler.
    #[must_use]
    pub fn recorder(&self) -> &Arc<TaskRecorder> {
        &self.recorder
    }

    /// Returns the backoff clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<RecordingClock> {
        &self.clock
    }

    /// Renders the document.
    pub fn yaml(&self) -> Result<String, ConfigError> {
        let mut body = Mapping::new();
        if !self.core.is_empty() {
            body.insert(YamlValue::from("core"), YamlValue::Mapping(self.core.clone()));
        }
        if !self.secrets.is_empty() {
            body.insert(YamlValue::from("secrets"), YamlValue::Sequence(self.secrets.clone()));
        }
        for (task_type, instances) in &self.sections {
            body.insert(YamlValue::from(task_type.as_str()), YamlValue::Sequence(instances.clone()));
        }
        let mut root = Mapping::new();
        root.insert(YamlValue::from(self.name.as_str()), YamlValue::Mapping(body));
        Ok(serde_yaml::to_string(&root)?)
    }

    /// Parses the rendered document.
    pub fn spec(&self) -> Result<PipelineSpec, ConfigError> {
        PipelineSpec::from_yaml_str(&self.yaml()?)
    }

    /// A catalog with one mock package per declared task type.
    #[must_use]
    pub fn catalog(&self) -> PackageCatalog {
        self.sections
            .iter()
            .fold(PackageCatalog::new(), |catalog, (task_type, _)| {
                catalog.with_package(self.recorder.package(task_type))
            })
    }

    /// Loads the document into a ready-to-run orchestrator.
    pub fn orchestrator(&self) -> Result<Orchestrator, OrchestratorError> {
        let spec = self.spec()?;
        let registry = TaskRegistry::load(&self.catalog(), spec.task_types())?;
        Ok(Orchestrator::new(spec, registry)?.with_clock(self.clock.clone()))
    }
}

fn to_yaml(value: &Value) -> YamlValue {
    serde_yaml::to_value(value).unwrap_or(YamlValue::Null)
}
