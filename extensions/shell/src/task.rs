//! The shell task handler.

use crate::config::ShellConfig;
use async_trait::async_trait;
use pipeline_orchestrator::errors::TaskError;
use pipeline_orchestrator::handler::{Sandbox, TaskHandler, TaskInit, TaskOutputs, TaskState};
use pipeline_orchestrator::state::StateExporter;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Name of the transient resource recorded for one command.
///
/// `command.<instance>.<first 8 hex digits of the command's SHA-256>`.
#[must_use]
pub fn resource_name(instance: &str, command: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(command.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("command.{instance}.{}", &digest[..8])
}

/// Runs shell commands and scripts inside the instance's sandbox.
///
/// Each command's result is exported under `<name>_output` as
/// `{command, output, exit_code}`. A non-zero exit exports
/// `<name>_error` as `{command, error, exit_code}` and fails the attempt
/// with a `CalledProcessError`.
#[derive(Debug, Default)]
pub struct ShellTask {
    name: String,
    config: Option<ShellConfig>,
    sandbox: Option<Arc<dyn Sandbox>>,
    state: TaskState,
}

impl ShellTask {
    /// Creates an uninitialized handler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn run_command(
        &mut self,
        config: &ShellConfig,
        sandbox: &Arc<dyn Sandbox>,
        command: &str,
    ) -> Result<(), TaskError> {
        let resource = resource_name(&self.name, command);
        self.state.set_state(
            resource.clone(),
            json!({
                "command": command,
                "shell_type": &config.shell,
                "isolation": sandbox.kind(),
                "config_name": &self.name,
            }),
        );

        debug!(instance = %self.name, resource = %resource, "Running command");
        let output = sandbox.run(&config.wrap(command)).await?;

        if output.success() {
            self.state.export_output(
                format!("{}_output", self.name),
                json!({
                    "command": command,
                    "output": output.stdout.trim(),
                    "exit_code": output.exit_code,
                }),
            );
            return Ok(());
        }

        warn!(
            instance = %self.name,
            resource = %resource,
            exit_code = output.exit_code,
            "Command failed"
        );
        self.state.export_output(
            format!("{}_error", self.name),
            json!({
                "command": command,
                "error": &output.stderr,
                "exit_code": output.exit_code,
            }),
        );
        Err(TaskError::execution(
            "CalledProcessError",
            format!("command '{command}' returned non-zero exit status {}", output.exit_code),
        ))
    }
}

#[async_trait]
impl TaskHandler for ShellTask {
    async fn initialize(&mut self, init: TaskInit) -> Result<(), TaskError> {
        let config = ShellConfig::from_value(init.config)?;
        debug!(
            instance = %init.name,
            stack = %init.stack_identifier,
            commands = config.commands.len(),
            scripts = config.scripts.len(),
            "Initialized shell task"
        );
        self.name = init.name;
        self.config = Some(config);
        self.sandbox = Some(init.sandbox);
        Ok(())
    }

    async fn execute(&mut self) -> Result<TaskOutputs, TaskError> {
        let (Some(config), Some(sandbox)) = (self.config.clone(), self.sandbox.clone()) else {
            return Err(TaskError::invalid_config("shell task executed before initialize"));
        };

        // Outputs describe the latest attempt only. Resources touched by
        // failed attempts stay recorded so cleanup exports them.
        self.state.clear_outputs();
        for command in config.command_lines() {
            self.run_command(&config, &sandbox, &command).await?;
        }

        info!(instance = %self.name, resources = self.state.state().len(), "Shell task completed");
        Ok(TaskOutputs::new()
            .with_outputs(self.state.outputs().clone())
            .with_transient_state(self.state.state().clone()))
    }

    fn get_output_data(&self) -> Map<String, Value> {
        self.state.outputs().clone()
    }

    async fn cleanup(&mut self, exporter: &StateExporter) -> Result<(), TaskError> {
        self.state.export_final(exporter).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_orchestrator::config::InstanceId;
    use pipeline_orchestrator::handler::HostSandbox;
    use pipeline_orchestrator::state::InMemoryBackend;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    async fn initialized(config: Value) -> ShellTask {
        let mut task = ShellTask::new();
        task.initialize(TaskInit {
            name: "deploy".to_string(),
            config,
            stack_identifier: "lab.shell.deploy".to_string(),
            sandbox: Arc::new(HostSandbox::new()),
        })
        .await
        .unwrap();
        task
    }

    #[test]
    fn test_resource_name_is_stable() {
        let a = resource_name("deploy", "echo hi");
        assert_eq!(a, resource_name("deploy", "echo hi"));
        assert_ne!(a, resource_name("deploy", "echo bye"));
        assert!(a.starts_with("command.deploy."));
        assert_eq!(a.len(), "command.deploy.".len() + 8);
    }

    #[tokio::test]
    async fn test_command_output_exported() {
        let mut task = initialized(json!({"type": "sh", "commands": ["echo hello", "echo world"]})).await;

        let outputs = task.execute().await.unwrap();

        let group = outputs.outputs["deploy_output"].as_array().unwrap();
        assert_eq!(group.len(), 2);
        assert_eq!(group[0]["output"], "hello");
        assert_eq!(group[0]["exit_code"], 0);
        assert_eq!(outputs.transient_state.len(), 2);
        assert_eq!(task.get_output_data(), outputs.outputs);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_called_process_error() {
        let mut task = initialized(json!({"type": "sh", "commands": ["echo oops >&2; exit 3", "echo never"]})).await;

        let err = task.execute().await.unwrap_err();

        assert_eq!(err.kind_name(), "CalledProcessError");
        let error = &task.get_output_data()["deploy_error"][0];
        assert_eq!(error["exit_code"], 3);
        assert_eq!(error["error"].as_str().map(str::trim), Some("oops"));
        assert!(task.get_output_data().get("deploy_output").is_none());
    }

    #[tokio::test]
    async fn test_script_runs_with_interpreter() {
        let mut script = tempfile::NamedTempFile::new().unwrap();
        writeln!(script, "echo from-script").unwrap();
        let location = script.path().to_string_lossy().into_owned();

        let mut task = initialized(json!({
            "type": "sh",
            "scripts": [{"file": "setup.sh", "type": "sh", "location": location}],
        }))
        .await;

        let outputs = task.execute().await.unwrap();
        assert_eq!(outputs.outputs["deploy_output"][0]["output"], "from-script");
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_initialize() {
        let mut task = ShellTask::new();
        let err = task
            .initialize(TaskInit {
                name: "deploy".to_string(),
                config: json!({}),
                stack_identifier: "lab.shell.deploy".to_string(),
                sandbox: Arc::new(HostSandbox::new()),
            })
            .await
            .unwrap_err();
        assert!(!err.is_execution());
    }

    #[tokio::test]
    async fn test_retry_keeps_resources_from_failed_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let marker = marker.to_string_lossy();
        // The first attempt runs both commands and fails on the second. The
        // retry stops at the first command because the marker now exists.
        let mut task = initialized(json!({
            "type": "sh",
            "commands": [format!("test ! -f '{marker}'"), format!("touch '{marker}'; exit 1")],
        }))
        .await;

        task.execute().await.unwrap_err();
        task.execute().await.unwrap_err();

        assert_eq!(task.state.state().len(), 2);
        let errors = task.get_output_data()["deploy_error"].as_array().unwrap().clone();
        assert_eq!(errors.len(), 1);
        assert!(errors[0]["command"].as_str().unwrap().starts_with("test ! -f"));

        let backend = Arc::new(InMemoryBackend::new());
        let id = InstanceId::new("shell", "deploy");
        task.cleanup(&StateExporter::new(backend.clone(), "lab", id.clone()))
            .await
            .unwrap();
        let exported = &backend.exports_for(&id)[0].transient_state;
        assert_eq!(exported.as_object().map(Map::len), Some(2));
    }

    #[tokio::test]
    async fn test_cleanup_exports_and_clears_state() {
        let mut task = initialized(json!({"type": "sh", "commands": ["true"]})).await;
        task.execute().await.unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        let id = InstanceId::new("shell", "deploy");

        task.cleanup(&StateExporter::new(backend.clone(), "lab", id.clone()))
            .await
            .unwrap();

        let exports = backend.exports_for(&id);
        assert_eq!(exports.len(), 1);
        assert_eq!(exports[0].transient_state.as_object().map(Map::len), Some(1));
        assert!(exports[0].outputs.get("deploy_output").is_some());
        assert!(task.state.state().is_empty());
        assert!(!task.get_output_data().is_empty());
    }
}
