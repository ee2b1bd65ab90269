//! Pipeline-wide settings from the document's `core` section.

use crate::errors::{ConfigError, TaskError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

/// Image used for container isolation when none is declared.
pub const DEFAULT_BASE_IMAGE: &str = "ubuntu:22.04";

/// Converts validated seconds to a duration, saturating on overflow.
pub(crate) fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

fn check_seconds(value: f64, field: &str) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::new(format!("{field} must be a non-negative number of seconds, got {value}")))
    }
}

/// Retry policy for a node's `execute()` calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Base delay between attempts.
    pub delay_seconds: f64,
    /// Doubles the delay after every failed attempt when set.
    pub exponential_backoff: bool,
    /// Error kind names that may be retried.
    #[serde(rename = "retry_on_exceptions")]
    pub retryable_error_kinds: BTreeSet<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_seconds: 5.0,
            exponential_backoff: true,
            retryable_error_kinds: ["ConnectionError", "TimeoutError"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl RetryPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_delay_seconds(mut self, delay: f64) -> Self {
        self.delay_seconds = delay;
        self
    }

    /// Enables or disables exponential backoff.
    #[must_use]
    pub fn with_exponential_backoff(mut self, enabled: bool) -> Self {
        self.exponential_backoff = enabled;
        self
    }

    /// Replaces the retryable error kinds.
    #[must_use]
    pub fn with_retryable<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_error_kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    /// Returns this policy with every field set in `over` replacing ours.
    #[must_use]
    pub fn merged(&self, over: &RetryOverride) -> Self {
        Self {
            max_attempts: over.max_attempts.unwrap_or(self.max_attempts),
            delay_seconds: over.delay_seconds.unwrap_or(self.delay_seconds),
            exponential_backoff: over.exponential_backoff.unwrap_or(self.exponential_backoff),
            retryable_error_kinds: over
                .retry_on_exceptions
                .clone()
                .unwrap_or_else(|| self.retryable_error_kinds.clone()),
        }
    }

    /// Returns true when `error` is an execution error on the allow-list.
    #[must_use]
    pub fn is_retryable(&self, error: &TaskError) -> bool {
        error.is_execution() && self.retryable_error_kinds.contains(error.kind_name())
    }

    /// Delay to wait after `failed_attempt` (1-based) before the next one.
    ///
    /// `delay_seconds * 2^(failed_attempt - 1)` with exponential backoff,
    /// `delay_seconds` otherwise.
    #[must_use]
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        if !self.exponential_backoff {
            return seconds(self.delay_seconds);
        }
        let exponent = i32::try_from(failed_attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        seconds(self.delay_seconds * 2f64.powi(exponent))
    }

    pub(crate) fn validate(&self, path: &str) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::new("max_attempts must be at least 1").with_path(path));
        }
        check_seconds(self.delay_seconds, "delay_seconds").map_err(|e| e.with_path(path))
    }
}

/// Instance-level retry fields; each one set replaces the pipeline default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryOverride {
    /// Overrides `max_attempts`.
    pub max_attempts: Option<u32>,
    /// Overrides `delay_seconds`.
    pub delay_seconds: Option<f64>,
    /// Overrides `exponential_backoff`.
    pub exponential_backoff: Option<bool>,
    /// Overrides `retry_on_exceptions`.
    pub retry_on_exceptions: Option<BTreeSet<String>>,
}

/// `core.execution_defaults`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionDefaults {
    /// Upper bound on a single `execute()` attempt.
    pub timeout_seconds: f64,
    /// Pipeline-wide retry policy.
    pub retry: RetryPolicy,
}

impl Default for ExecutionDefaults {
    fn default() -> Self {
        Self {
            timeout_seconds: 300.0,
            retry: RetryPolicy::default(),
        }
    }
}

/// How far a node failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlastRadius {
    /// Skip transitive dependents only; unrelated branches continue.
    #[default]
    Dependents,
    /// Stop dispatching anything new once a node fails.
    Pipeline,
}

/// Where cleanup exports transient provisioning state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateBackendConfig {
    /// Keep exports in process memory.
    #[default]
    Memory,
    /// Write one JSON file per instance under `path`.
    File {
        /// Target directory.
        path: PathBuf,
    },
}

/// The `core` section of a pipeline document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    /// Timeout and retry defaults.
    pub execution_defaults: ExecutionDefaults,
    /// Maximum nodes running at once; `None` is unbounded.
    pub max_concurrency: Option<usize>,
    /// Failure propagation policy.
    pub blast_radius: BlastRadius,
    /// Time running nodes get to finish after cancellation.
    pub cancellation_grace_seconds: f64,
    /// Chain instances of the same type in declaration order.
    pub sequential_within_type: bool,
    /// Stack name prefix for state exports; defaults to the pipeline name.
    pub stack_name: Option<String>,
    /// State export target.
    pub state_backend: StateBackendConfig,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            execution_defaults: ExecutionDefaults::default(),
            max_concurrency: None,
            blast_radius: BlastRadius::default(),
            cancellation_grace_seconds: 30.0,
            sequential_within_type: true,
            stack_name: None,
            state_backend: StateBackendConfig::default(),
        }
    }
}

impl CoreSettings {
    /// Returns the execution timeout as a duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        seconds(self.execution_defaults.timeout_seconds)
    }

    /// Returns the cancellation grace period as a duration.
    #[must_use]
    pub fn cancellation_grace(&self) -> Duration {
        seconds(self.cancellation_grace_seconds)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == Some(0) {
            return Err(ConfigError::new("max_concurrency must be at least 1").with_path("core"));
        }
        check_seconds(self.execution_defaults.timeout_seconds, "timeout_seconds")
            .map_err(|e| e.with_path("core.execution_defaults"))?;
        check_seconds(self.cancellation_grace_seconds, "cancellation_grace_seconds")
            .map_err(|e| e.with_path("core"))?;
        self.execution_defaults
            .retry
            .validate("core.execution_defaults.retry")
    }
}

/// Sandbox kind for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationKind {
    /// Run directly on the host.
    #[default]
    Host,
    /// Run inside an ephemeral container.
    Container,
}

/// Per-instance `isolation` block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IsolationDescriptor {
    /// Sandbox kind.
    #[serde(rename = "type", default)]
    pub kind: IsolationKind,
    /// Container image.
    #[serde(default)]
    pub base_image: Option<String>,
}

impl IsolationDescriptor {
    /// Host isolation.
    #[must_use]
    pub fn host() -> Self {
        Self::default()
    }

    /// Container isolation seeded from `image`.
    #[must_use]
    pub fn container(image: impl Into<String>) -> Self {
        Self {
            kind: IsolationKind::Container,
            base_image: Some(image.into()),
        }
    }

    /// Returns the image to start, falling back to the default.
    #[must_use]
    pub fn image(&self) -> &str {
        self.base_image.as_deref().unwrap_or(DEFAULT_BASE_IMAGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_retry_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_seconds, 5.0);
        assert!(policy.exponential_backoff);
        assert!(policy.retryable_error_kinds.contains("ConnectionError"));
        assert!(policy.retryable_error_kinds.contains("TimeoutError"));
    }

    #[test]
    fn test_merge_is_field_by_field() {
        let base = RetryPolicy::default();
        let over = RetryOverride {
            max_attempts: Some(5),
            ..RetryOverride::default()
        };
        let merged = base.merged(&over);
        assert_eq!(merged.max_attempts, 5);
        assert_eq!(merged.delay_seconds, base.delay_seconds);
        assert_eq!(merged.retryable_error_kinds, base.retryable_error_kinds);
    }

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3), Duration::from_secs(20));

        let flat = policy.with_exponential_backoff(false);
        assert_eq!(flat.delay_for(3), Duration::from_secs(5));
    }

    #[test]
    fn test_retryable_classification() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(&TaskError::execution("ConnectionError", "reset")));
        assert!(!policy.is_retryable(&TaskError::execution("CalledProcessError", "exit 2")));
        assert!(!policy.is_retryable(&TaskError::isolation("docker missing")));
    }

    #[test]
    fn test_core_validation() {
        let mut core = CoreSettings::default();
        assert!(core.validate().is_ok());

        core.max_concurrency = Some(0);
        assert!(core.validate().is_err());

        core.max_concurrency = None;
        core.execution_defaults.retry.max_attempts = 0;
        assert!(core.validate().is_err());
    }

    #[test]
    fn test_isolation_image_default() {
        assert_eq!(IsolationDescriptor::host().image(), DEFAULT_BASE_IMAGE);
        assert_eq!(IsolationDescriptor::container("alpine:3.20").image(), "alpine:3.20");
    }

    #[test]
    fn test_state_backend_tagged() {
        let file: StateBackendConfig =
            serde_yaml::from_str("type: file\npath: /var/lib/pipeline").unwrap();
        assert_eq!(
            file,
            StateBackendConfig::File {
                path: PathBuf::from("/var/lib/pipeline")
            }
        );
    }
}
