//! Isolation sandboxes.
//!
//! The scheduler creates one sandbox per node from its
//! [`IsolationDescriptor`], hands it to the task in `initialize`, and tears
//! it down after cleanup on every path.

use crate::config::{InstanceId, IsolationDescriptor, IsolationKind};
use crate::errors::IsolationError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Output;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Result of one command run inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Exit code; -1 when the process was killed by a signal.
    pub exit_code: i32,
}

impl CommandOutput {
    /// Returns true for a zero exit code.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        }
    }
}

/// An execution boundary for task commands.
#[async_trait]
pub trait Sandbox: Send + Sync + std::fmt::Debug {
    /// The isolation kind.
    fn kind(&self) -> IsolationKind;

    /// Runs a shell command inside the boundary.
    ///
    /// A non-zero exit is reported in the output, not as an error.
    async fn run(&self, command: &str) -> Result<CommandOutput, IsolationError>;

    /// Releases everything the sandbox holds. Idempotent.
    async fn teardown(&self) -> Result<(), IsolationError>;
}

/// Creates the sandbox an instance declared.
#[must_use]
pub fn sandbox_for(descriptor: &IsolationDescriptor, instance: &InstanceId) -> Arc<dyn Sandbox> {
    match descriptor.kind {
        IsolationKind::Host => Arc::new(HostSandbox::new()),
        IsolationKind::Container => Arc::new(ContainerSandbox::new(descriptor.image(), instance)),
    }
}

/// Runs commands with `sh -c` on the host.
#[derive(Debug, Clone, Default)]
pub struct HostSandbox;

impl HostSandbox {
    /// Creates a host sandbox.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Sandbox for HostSandbox {
    fn kind(&self) -> IsolationKind {
        IsolationKind::Host
    }

    async fn run(&self, command: &str) -> Result<CommandOutput, IsolationError> {
        debug!(command = %command, "Running host command");
        Command::new("sh")
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .output()
            .await
            .map(CommandOutput::from)
            .map_err(|e| IsolationError::new(format!("failed to spawn sh: {e}")))
    }

    async fn teardown(&self) -> Result<(), IsolationError> {
        Ok(())
    }
}

/// An ephemeral container, started on first use and removed on teardown.
#[derive(Debug)]
pub struct ContainerSandbox {
    runtime: String,
    image: String,
    name: String,
    instance: String,
    container_id: Mutex<Option<String>>,
}

impl ContainerSandbox {
    /// Creates a sandbox for `instance` seeded from `image`.
    #[must_use]
    pub fn new(image: impl Into<String>, instance: &InstanceId) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let base: String = instance
            .to_string()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .collect();
        Self {
            runtime: "docker".to_string(),
            image: image.into(),
            name: format!("pipeline-{base}-{}", &suffix[..8]),
            instance: instance.to_string(),
            container_id: Mutex::new(None),
        }
    }

    /// Uses a different container CLI (e.g. `podman`).
    #[must_use]
    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = runtime.into();
        self
    }

    /// Returns the image.
    #[must_use]
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Returns the container name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn error(&self, message: String) -> IsolationError {
        IsolationError::new(message).with_instance(self.instance.clone())
    }

    async fn runtime_command(&self, args: &[&str]) -> Result<CommandOutput, IsolationError> {
        Command::new(&self.runtime)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map(CommandOutput::from)
            .map_err(|e| self.error(format!("failed to invoke {}: {e}", self.runtime)))
    }

    async fn ensure_started(&self) -> Result<String, IsolationError> {
        let mut guard = self.container_id.lock().await;
        if let Some(id) = guard.as_ref() {
            return Ok(id.clone());
        }

        let started = self
            .runtime_command(&["run", "-d", "--rm", "--name", &self.name, &self.image, "sleep", "infinity"])
            .await?;
        if !started.success() {
            return Err(self.error(format!(
                "container start from '{}' exited with {}: {}",
                self.image,
                started.exit_code,
                started.stderr.trim()
            )));
        }

        let id = started.stdout.trim().to_string();
        info!(container = %self.name, image = %self.image, "Started sandbox container");
        *guard = Some(id.clone());
        Ok(id)
    }
}

#[async_trait]
impl Sandbox for ContainerSandbox {
    fn kind(&self) -> IsolationKind {
        IsolationKind::Container
    }

    async fn run(&self, command: &str) -> Result<CommandOutput, IsolationError> {
        let id = self.ensure_started().await?;
        debug!(container = %self.name, command = %command, "Running container command");
        self.runtime_command(&["exec", &id, "sh", "-c", command]).await
    }

    async fn teardown(&self) -> Result<(), IsolationError> {
        let Some(id) = self.container_id.lock().await.take() else {
            return Ok(());
        };
        let removed = self.runtime_command(&["rm", "-f", &id]).await?;
        if !removed.success() {
            return Err(self.error(format!("container removal failed: {}", removed.stderr.trim())));
        }
        info!(container = %self.name, "Removed sandbox container");
        Ok(())
    }
}
