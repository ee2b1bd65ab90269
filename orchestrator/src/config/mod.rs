//! Pipeline document model and loading.

mod ids;
mod loader;
mod settings;
mod spec;

pub use ids::{InstanceId, TaskType, RESERVED_SECTIONS};
pub use loader::{config_path_from_env, PIPELINE_CONFIG_ENV};
pub use settings::{
    BlastRadius, CoreSettings, ExecutionDefaults, IsolationDescriptor, IsolationKind, RetryOverride,
    RetryPolicy, StateBackendConfig, DEFAULT_BASE_IMAGE,
};
pub use spec::{InstanceSpec, PipelineSpec, TypeSection, RESERVED_INSTANCE_KEYS};

pub(crate) use settings::seconds;
