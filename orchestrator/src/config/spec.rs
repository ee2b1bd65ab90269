//! Parsed pipeline specification.

use super::ids::{InstanceId, TaskType};
use super::settings::{seconds, CoreSettings, IsolationDescriptor, RetryOverride, RetryPolicy};
use crate::reference::{ConfigTemplate, SecretStore};
use serde_json::Value;
use std::time::Duration;

/// Keys consumed by the orchestrator and removed from `raw_config`.
pub const RESERVED_INSTANCE_KEYS: &[&str] = &["name", "isolation", "retry", "timeout_seconds", "independent"];

/// One declared task instance.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    /// Task type (the section it was declared in).
    pub task_type: TaskType,
    /// Instance name, unique within the pipeline for its type.
    pub name: String,
    /// Task-specific configuration with orchestrator keys removed.
    pub raw_config: Value,
    /// `raw_config` with reference tokens parsed.
    pub template: ConfigTemplate,
    /// Sandbox to run in.
    pub isolation: IsolationDescriptor,
    /// Instance-level retry fields.
    pub retry: Option<RetryOverride>,
    /// Instance-level execution timeout.
    pub timeout_seconds: Option<f64>,
    /// Opts out of the implicit same-type ordering.
    pub independent: bool,
    /// Position across the whole document, used as the scheduling tie-break.
    pub declaration_index: usize,
}

impl InstanceSpec {
    /// Returns the qualified id.
    #[must_use]
    pub fn id(&self) -> InstanceId {
        InstanceId::new(self.task_type.as_str(), &self.name)
    }

    /// Returns the pipeline policy merged with this instance's overrides.
    #[must_use]
    pub fn retry_policy(&self, defaults: &RetryPolicy) -> RetryPolicy {
        self.retry
            .as_ref()
            .map_or_else(|| defaults.clone(), |over| defaults.merged(over))
    }

    /// Returns the execution timeout, falling back to `default`.
    #[must_use]
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_seconds.map_or(default, seconds)
    }
}

/// Instances declared under one task type, in document order.
#[derive(Debug, Clone)]
pub struct TypeSection {
    /// The section's task type.
    pub task_type: TaskType,
    /// Its instances.
    pub instances: Vec<InstanceSpec>,
}

/// A fully parsed pipeline document.
#[derive(Debug, Clone)]
pub struct PipelineSpec {
    /// The pipeline name (the document's root key).
    pub name: String,
    /// The `core` section.
    pub core: CoreSettings,
    /// Task sections in document order.
    pub sections: Vec<TypeSection>,
    /// Vaults from the `secrets` section.
    pub secrets: SecretStore,
}

impl PipelineSpec {
    /// Creates an empty spec with default settings.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            core: CoreSettings::default(),
            sections: Vec::new(),
            secrets: SecretStore::new(),
        }
    }

    /// Iterates every instance in declaration order.
    pub fn instances(&self) -> impl Iterator<Item = &InstanceSpec> {
        self.sections.iter().flat_map(|s| s.instances.iter())
    }

    /// Number of declared instances.
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.sections.iter().map(|s| s.instances.len()).sum()
    }

    /// Finds an instance by id.
    #[must_use]
    pub fn instance(&self, id: &InstanceId) -> Option<&InstanceSpec> {
        self.sections
            .iter()
            .find(|s| s.task_type.as_str() == id.task_type())
            .and_then(|s| s.instances.iter().find(|i| i.name == id.name()))
    }

    /// Returns the declared task types.
    pub fn task_types(&self) -> impl Iterator<Item = &TaskType> {
        self.sections.iter().map(|s| &s.task_type)
    }

    /// Stack name used to qualify state exports.
    #[must_use]
    pub fn stack_name(&self) -> &str {
        self.core.stack_name.as_deref().unwrap_or(&self.name)
    }

    /// Stack identifier handed to one instance's `initialize`.
    #[must_use]
    pub fn stack_identifier(&self, id: &InstanceId) -> String {
        format!("{}.{id}", self.stack_name())
    }
}
