//! Shell task configuration.

use pipeline_orchestrator::errors::TaskError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_shell() -> String {
    "bash".to_string()
}

fn is_program_name(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'))
}

/// A script to run with an interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShellScript {
    /// Script name, used in logs.
    pub file: String,
    /// Interpreter (`bash`, `sh`, `python3`, ...).
    #[serde(rename = "type")]
    pub interpreter: String,
    /// Path of the script inside the sandbox.
    pub location: String,
}

/// Configuration of one `shell` instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShellConfig {
    /// Shell that runs each command.
    #[serde(rename = "type", default = "default_shell")]
    pub shell: String,
    /// Scripts, run after the commands.
    #[serde(default)]
    pub scripts: Vec<ShellScript>,
    /// Commands, run in order.
    #[serde(default)]
    pub commands: Vec<String>,
}

impl ShellConfig {
    /// Parses and validates a resolved instance configuration.
    pub fn from_value(value: Value) -> Result<Self, TaskError> {
        let config: Self =
            serde_json::from_value(value).map_err(|e| TaskError::invalid_config(format!("shell: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), TaskError> {
        if self.commands.is_empty() && self.scripts.is_empty() {
            return Err(TaskError::invalid_config(
                "shell: either scripts or commands must be provided",
            ));
        }
        if !is_program_name(&self.shell) {
            return Err(TaskError::invalid_config(format!("shell: invalid shell type '{}'", self.shell)));
        }
        if let Some(script) = self.scripts.iter().find(|s| !is_program_name(&s.interpreter)) {
            return Err(TaskError::invalid_config(format!(
                "shell: invalid interpreter '{}' for script '{}'",
                script.interpreter, script.file
            )));
        }
        Ok(())
    }

    /// Every command line to run, commands first, then scripts.
    #[must_use]
    pub fn command_lines(&self) -> Vec<String> {
        self.commands
            .iter()
            .cloned()
            .chain(
                self.scripts
                    .iter()
                    .map(|s| format!("{} {}", s.interpreter, quote(&s.location))),
            )
            .collect()
    }

    /// Wraps a command line so it runs under the configured shell.
    #[must_use]
    pub fn wrap(&self, command: &str) -> String {
        format!("{} -c {}", self.shell, quote(command))
    }
}

/// Single-quotes `s` for a POSIX shell.
pub(crate) fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
