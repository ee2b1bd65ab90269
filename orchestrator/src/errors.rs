//! Error types for the pipeline orchestrator.
//!
//! The taxonomy separates failures that are fatal before anything runs
//! (configuration, loading, cycles, unresolvable references) from failures
//! scoped to a single node (execution, isolation) and from orchestrator
//! invariant violations (state errors).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Exit code for a run where every node succeeded.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for a run with at least one failed or skipped node.
pub const EXIT_NODE_FAILURE: i32 = 1;
/// Exit code for failures detected before any node was dispatched.
pub const EXIT_PRE_EXECUTION: i32 = 2;
/// Exit code for a run stopped by an external cancellation.
pub const EXIT_CANCELLED: i32 = 3;
/// Exit code for an orchestrator invariant violation.
pub const EXIT_INTERNAL: i32 = 4;

/// Errors that stop a pipeline before any node is dispatched.
///
/// Failures scoped to a node ([`ExecutionError`], [`IsolationError`]) and
/// bookkeeping violations ([`StateError`]) never abort `run`; they are
/// recorded in the run report instead.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The pipeline document is malformed.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A task package could not be loaded.
    #[error("{0}")]
    Loader(#[from] LoaderError),

    /// The static reference graph contains a cycle.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// A reference names an instance that is not declared.
    #[error("{0}")]
    Reference(#[from] ReferenceError),
}

impl OrchestratorError {
    /// Returns the process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        EXIT_PRE_EXECUTION
    }

    /// Returns the diagnostic info attached to the error.
    pub fn error_info(&self) -> Option<&ErrorInfo> {
        Some(match self {
            Self::Config(e) => &e.error_info,
            Self::Loader(e) => &e.error_info,
            Self::CycleDetected(e) => &e.error_info,
            Self::Reference(e) => &e.error_info,
        })
    }
}

/// Diagnostic metadata attached to pre-execution errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ErrorInfo {
    /// Stable error code (e.g. "GRAPH-001-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: BTreeMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when the pipeline document is malformed.
#[derive(Debug, Clone, Error)]
#[error("Configuration error{}: {message}", .path.as_ref().map(|p| format!(" at '{p}'")).unwrap_or_default())]
pub struct ConfigError {
    /// The error message.
    pub message: String,
    /// Location in the document, if known (e.g. "core.execution_defaults").
    pub path: Option<String>,
    /// Diagnostic info.
    pub error_info: ErrorInfo,
}

impl ConfigError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            error_info: ErrorInfo::new("CONFIG-001-INVALID", message.clone()),
            message,
            path: None,
        }
    }

    /// Sets the document location.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.error_info = self.error_info.with_context_entry("path", path.clone());
        self.path = Some(path);
        self
    }

    /// Sets the error code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.error_info.code = code.into();
        self
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.error_info = self.error_info.with_fix_hint(hint);
        self
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        let config = Self::new(err.to_string()).with_code("CONFIG-002-PARSE");
        match err.location() {
            Some(loc) => config.with_path(format!("line {}, column {}", loc.line(), loc.column())),
            None => config,
        }
    }
}

/// Why a task package was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoaderErrorKind {
    /// No installed package provides the declared type.
    UnknownType,
    /// The package requires a newer core.
    IncompatibleVersion,
    /// The package does not expose a required capability.
    MissingCapability,
    /// Two packages provide the same type, or a package name is malformed.
    InvalidPackage,
}

/// Error raised when a task type cannot be loaded.
#[derive(Debug, Clone, Error)]
#[error("Failed to load task type '{type_name}': {message}")]
pub struct LoaderError {
    /// The failure class.
    pub kind: LoaderErrorKind,
    /// The task type being loaded.
    pub type_name: String,
    /// Human-readable detail.
    pub message: String,
    /// Diagnostic info.
    pub error_info: ErrorInfo,
}

impl LoaderError {
    /// Creates a new loader error.
    #[must_use]
    pub fn new(kind: LoaderErrorKind, type_name: impl Into<String>, message: impl Into<String>) -> Self {
        let type_name = type_name.into();
        let message = message.into();
        let code = match kind {
            LoaderErrorKind::UnknownType => "LOADER-001-UNKNOWN-TYPE",
            LoaderErrorKind::IncompatibleVersion => "LOADER-002-VERSION",
            LoaderErrorKind::MissingCapability => "LOADER-003-CAPABILITY",
            LoaderErrorKind::InvalidPackage => "LOADER-004-PACKAGE",
        };
        Self {
            error_info: ErrorInfo::new(code, message.clone()).with_context_entry("type", type_name.clone()),
            kind,
            type_name,
            message,
        }
    }

    /// Creates an unknown-type error.
    #[must_use]
    pub fn unknown_type(type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        let package = format!("pipeline-orchestrator-extension-{}", type_name.replace('_', "-"));
        let mut err = Self::new(
            LoaderErrorKind::UnknownType,
            type_name,
            format!("no installed package provides this type (expected '{package}')"),
        );
        err.error_info = err.error_info.with_fix_hint(format!("Install and register the '{package}' package."));
        err
    }
}

/// Error raised when the static reference graph contains a cycle.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in pipeline: {}", .cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// Qualified instance ids forming the cycle, first id repeated at the end.
    pub cycle_path: Vec<String>,
    /// Diagnostic info.
    pub error_info: ErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ErrorInfo::new(
            "GRAPH-001-CYCLE",
            format!("Pipeline contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the _group references in the cycle, or mark an instance 'independent: true'.");

        Self {
            cycle_path,
            error_info: info,
        }
    }

    /// Returns the distinct instances in the cycle.
    #[must_use]
    pub fn members(&self) -> &[String] {
        match self.cycle_path.split_last() {
            Some((_, rest)) if !rest.is_empty() => rest,
            _ => &self.cycle_path,
        }
    }
}

/// Why a reference could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceFailure {
    /// The referenced instance is not declared in the pipeline.
    UnknownInstance,
    /// The referenced instance has not reached Succeeded.
    NotYetSucceeded,
    /// The referenced instance has no such output group.
    UnknownGroup,
    /// The output group has no such node.
    UnknownNode,
    /// No such secret vault.
    UnknownVault,
    /// The vault has no value at the path.
    UnknownKey,
}

/// Error raised when a reference token cannot be resolved.
#[derive(Debug, Clone, Error)]
#[error("Unresolved reference '{token}' in '{requester}': {message}")]
pub struct ReferenceError {
    /// The token as written in the document.
    pub token: String,
    /// Qualified id of the instance whose config holds the token.
    pub requester: String,
    /// The failure class.
    pub reason: ReferenceFailure,
    /// Human-readable detail.
    pub message: String,
    /// Diagnostic info.
    pub error_info: ErrorInfo,
}

impl ReferenceError {
    /// Creates a new reference error.
    #[must_use]
    pub fn new(
        token: impl Into<String>,
        requester: impl Into<String>,
        reason: ReferenceFailure,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        let code = match reason {
            ReferenceFailure::UnknownInstance => "REF-001-UNKNOWN-INSTANCE",
            ReferenceFailure::NotYetSucceeded => "REF-002-NOT-READY",
            ReferenceFailure::UnknownGroup => "REF-003-UNKNOWN-GROUP",
            ReferenceFailure::UnknownNode => "REF-004-UNKNOWN-NODE",
            ReferenceFailure::UnknownVault => "REF-005-UNKNOWN-VAULT",
            ReferenceFailure::UnknownKey => "REF-006-UNKNOWN-KEY",
        };
        Self {
            token: token.into(),
            requester: requester.into(),
            reason,
            error_info: ErrorInfo::new(code, message.clone()),
            message,
        }
    }
}

/// Final failure of a node's `execute()`, after retries stopped.
#[derive(Debug, Clone, Error)]
#[error("Execution of '{instance}' failed after {attempts} attempt(s): {last_error}")]
pub struct ExecutionError {
    /// Qualified instance id.
    pub instance: String,
    /// Attempts made.
    pub attempts: u32,
    /// The error of the last attempt.
    #[source]
    pub last_error: TaskError,
}

impl ExecutionError {
    /// Creates a new execution error.
    #[must_use]
    pub fn new(instance: impl Into<String>, attempts: u32, last_error: TaskError) -> Self {
        Self {
            instance: instance.into(),
            attempts,
            last_error,
        }
    }

    /// Kind name of the last attempt's error.
    #[must_use]
    pub fn kind_name(&self) -> &str {
        self.last_error.kind_name()
    }
}

/// Error raised when a sandbox cannot be set up or torn down.
#[derive(Debug, Clone, Error)]
#[error("Isolation error{}: {message}", .instance.as_ref().map(|i| format!(" for '{i}'")).unwrap_or_default())]
pub struct IsolationError {
    /// Qualified instance id, if known.
    pub instance: Option<String>,
    /// Human-readable detail.
    pub message: String,
}

impl IsolationError {
    /// Creates a new isolation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            instance: None,
            message: message.into(),
        }
    }

    /// Sets the owning instance.
    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }
}

/// Error raised on an illegal state transition or duplicate terminal write.
#[derive(Debug, Clone, Error)]
#[error("State error{}: {message}", .instance.as_ref().map(|i| format!(" for '{i}'")).unwrap_or_default())]
pub struct StateError {
    /// Qualified instance id, if known.
    pub instance: Option<String>,
    /// Human-readable detail.
    pub message: String,
}

impl StateError {
    /// Creates a new state error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            instance: None,
            message: message.into(),
        }
    }

    /// Sets the owning instance.
    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }
}

/// Failure class of a [`TaskError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// Runtime failure, named for retry classification.
    Execution {
        /// Kind name (e.g. "ConnectionError").
        name: String,
    },
    /// Sandbox failure.
    Isolation,
    /// The resolved configuration was rejected by the task.
    InvalidConfig,
}

/// Error returned by task handler implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}: {message}", kind_label(.kind))]
pub struct TaskError {
    /// Failure class.
    pub kind: TaskErrorKind,
    /// Human-readable detail.
    pub message: String,
}

fn kind_label(kind: &TaskErrorKind) -> &str {
    match kind {
        TaskErrorKind::Execution { name } => name,
        TaskErrorKind::Isolation => "IsolationError",
        TaskErrorKind::InvalidConfig => "InvalidConfig",
    }
}

impl TaskError {
    /// Creates an execution error with a kind name.
    #[must_use]
    pub fn execution(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Execution { name: kind.into() },
            message: message.into(),
        }
    }

    /// Creates an isolation error.
    #[must_use]
    pub fn isolation(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Isolation,
            message: message.into(),
        }
    }

    /// Creates an invalid-config error.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::InvalidConfig,
            message: message.into(),
        }
    }

    /// Creates the error produced when an attempt exceeds its timeout.
    #[must_use]
    pub fn timeout(limit: Duration) -> Self {
        Self::execution(
            "TimeoutError",
            format!("execution exceeded {:.1}s", limit.as_secs_f64()),
        )
    }

    /// Returns the kind name used for retry classification.
    #[must_use]
    pub fn kind_name(&self) -> &str {
        kind_label(&self.kind)
    }

    /// Returns true for runtime failures (the only retryable class).
    #[must_use]
    pub fn is_execution(&self) -> bool {
        matches!(self.kind, TaskErrorKind::Execution { .. })
    }
}

impl From<IsolationError> for TaskError {
    fn from(err: IsolationError) -> Self {
        Self::isolation(err.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cycle_error_message() {
        let err = CycleDetectedError::new(vec![
            "terraform.a".to_string(),
            "ansible.b".to_string(),
            "terraform.a".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "Cycle detected in pipeline: terraform.a -> ansible.b -> terraform.a"
        );
        assert_eq!(err.members(), &["terraform.a".to_string(), "ansible.b".to_string()]);
        assert_eq!(err.error_info.code, "GRAPH-001-CYCLE");
    }

    #[test]
    fn test_exit_codes() {
        let config: OrchestratorError = ConfigError::new("bad").into();
        assert_eq!(config.exit_code(), EXIT_PRE_EXECUTION);

        let cycle: OrchestratorError = CycleDetectedError::new(vec!["a".into(), "a".into()]).into();
        assert_eq!(cycle.exit_code(), EXIT_PRE_EXECUTION);

        assert_eq!(cycle.error_info().map(|i| i.code.as_str()), Some("GRAPH-001-CYCLE"));
    }

    #[test]
    fn test_execution_error_keeps_last_attempt() {
        let err = ExecutionError::new("shell.a", 3, TaskError::execution("ConnectionError", "refused"));
        assert_eq!(err.kind_name(), "ConnectionError");
        assert_eq!(
            err.to_string(),
            "Execution of 'shell.a' failed after 3 attempt(s): ConnectionError: refused"
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_config_error_path() {
        let err = ConfigError::new("must be a list").with_path("terraform");
        assert_eq!(err.to_string(), "Configuration error at 'terraform': must be a list");
        assert_eq!(err.error_info.context.get("path").map(String::as_str), Some("terraform"));
    }

    #[test]
    fn test_task_error_kind_name() {
        assert_eq!(TaskError::execution("ConnectionError", "refused").kind_name(), "ConnectionError");
        assert_eq!(TaskError::timeout(Duration::from_secs(3)).kind_name(), "TimeoutError");
        assert_eq!(TaskError::isolation("no docker").kind_name(), "IsolationError");
        assert!(!TaskError::invalid_config("x").is_execution());
    }

    #[test]
    fn test_unknown_type_hint() {
        let err = LoaderError::unknown_type("cloud_init");
        assert_eq!(err.kind, LoaderErrorKind::UnknownType);
        assert!(err
            .error_info
            .fix_hint
            .as_deref()
            .is_some_and(|h| h.contains("pipeline-orchestrator-extension-cloud-init")));
    }
}
