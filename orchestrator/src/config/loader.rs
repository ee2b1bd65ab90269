//! Loading pipeline documents from YAML.
//!
//! Document shape:
//!
//! ```yaml
//! my-pipeline:
//!   core:
//!     execution_defaults:
//!       timeout_seconds: 300
//!       retry: {max_attempts: 3, delay_seconds: 5, exponential_backoff: true}
//!   secrets:
//!     - name: hello-world
//!       proxmox_password: abc
//!   terraform:
//!     - name: proxmox
//!       vars: {pm_password: _secret:hello-world:proxmox_password}
//! ```

use super::ids::{is_identifier, InstanceId, TaskType};
use super::settings::{CoreSettings, IsolationDescriptor, RetryOverride};
use super::spec::{InstanceSpec, PipelineSpec, TypeSection};
use crate::errors::ConfigError;
use crate::reference::{ConfigTemplate, SecretStore};
use serde_json::{Map, Value};
use serde_yaml::Value as YamlValue;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable holding the pipeline document path.
pub const PIPELINE_CONFIG_ENV: &str = "PIPELINE_CONFIG";

/// Reads the document path from [`PIPELINE_CONFIG_ENV`].
pub fn config_path_from_env() -> Result<PathBuf, ConfigError> {
    std::env::var_os(PIPELINE_CONFIG_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| {
            ConfigError::new(format!("{PIPELINE_CONFIG_ENV} is not set"))
                .with_code("CONFIG-004-ENV")
                .with_fix_hint(format!("Set {PIPELINE_CONFIG_ENV} to the pipeline YAML path."))
        })
}

impl PipelineSpec {
    /// Loads the document named by `PIPELINE_CONFIG`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_path(config_path_from_env()?)
    }

    /// Loads a document from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::new(format!("cannot read {}: {e}", path.display())).with_code("CONFIG-005-IO")
        })?;
        info!(path = %path.display(), "Loading pipeline document");
        Self::from_yaml_str(&text)
    }

    /// Parses a document from YAML (or JSON) text.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let doc: YamlValue = serde_yaml::from_str(text)?;
        let root = doc
            .as_mapping()
            .filter(|m| m.len() == 1)
            .ok_or_else(|| ConfigError::new("document must have exactly one top-level key naming the pipeline"))?;

        let mut entries = root.iter();
        let (name, body) = match entries.next() {
            Some((YamlValue::String(name), body)) => (name.clone(), body),
            _ => return Err(ConfigError::new("pipeline name must be a string")),
        };

        let mut spec = Self::new(name);
        let body = match body {
            YamlValue::Mapping(m) => m,
            YamlValue::Null => return Ok(spec),
            _ => return Err(ConfigError::new("pipeline body must be a mapping").with_path(&spec.name)),
        };

        let mut declaration_index = 0;
        for (key, value) in body {
            let key = key
                .as_str()
                .ok_or_else(|| ConfigError::new("section names must be strings").with_path(&spec.name))?;
            match key {
                "core" => {
                    if !value.is_null() {
                        spec.core = serde_yaml::from_value::<CoreSettings>(value.clone())
                            .map_err(|e| ConfigError::from(e).with_path("core"))?;
                    }
                }
                "secrets" => spec.secrets = load_secrets(value)?,
                other => {
                    let task_type = TaskType::new(other).map_err(|e| e.with_path(other))?;
                    let section = load_section(task_type, value, &mut declaration_index)?;
                    spec.sections.push(section);
                }
            }
        }

        spec.core.validate()?;
        if !is_identifier(spec.stack_name()) {
            return Err(ConfigError::new(format!(
                "invalid stack name '{}': use letters, digits, '_' or '-'",
                spec.stack_name()
            ))
            .with_code("CONFIG-007-NAME")
            .with_path("core.stack_name"));
        }
        for instance in spec.instances() {
            instance
                .retry_policy(&spec.core.execution_defaults.retry)
                .validate(&format!("{}.retry", instance.id()))?;
        }

        debug!(
            pipeline = %spec.name,
            sections = spec.sections.len(),
            instances = spec.instance_count(),
            vaults = ?spec.secrets.vault_names().collect::<Vec<_>>(),
            "Parsed pipeline document"
        );
        Ok(spec)
    }
}

fn to_json(value: &YamlValue, path: &str) -> Result<Value, ConfigError> {
    serde_json::to_value(value).map_err(|e| ConfigError::new(e.to_string()).with_path(path))
}

fn load_secrets(value: &YamlValue) -> Result<SecretStore, ConfigError> {
    let mut store = SecretStore::new();
    match value {
        YamlValue::Null => {}
        YamlValue::Mapping(vaults) => {
            for (name, data) in vaults {
                let name = name
                    .as_str()
                    .ok_or_else(|| ConfigError::new("vault names must be strings").with_path("secrets"))?;
                store.insert_vault(name, to_json(data, "secrets")?);
            }
        }
        YamlValue::Sequence(entries) => {
            for entry in entries {
                let mut object = match to_json(entry, "secrets")? {
                    Value::Object(object) => object,
                    _ => return Err(ConfigError::new("each vault must be a mapping").with_path("secrets")),
                };
                let name = match object.remove("name") {
                    Some(Value::String(name)) => name,
                    _ => return Err(ConfigError::new("each vault needs a string 'name'").with_path("secrets")),
                };
                if store.has_vault(&name) {
                    return Err(ConfigError::new(format!("duplicate vault '{name}'")).with_path("secrets"));
                }
                store.insert_vault(name, Value::Object(object));
            }
        }
        _ => return Err(ConfigError::new("must be a list or mapping of vaults").with_path("secrets")),
    }
    Ok(store)
}

fn load_section(
    task_type: TaskType,
    value: &YamlValue,
    declaration_index: &mut usize,
) -> Result<TypeSection, ConfigError> {
    let entries = match value {
        YamlValue::Null => Vec::new(),
        YamlValue::Sequence(entries) => entries.iter().collect(),
        _ => return Err(ConfigError::new("must be a list of instances").with_path(task_type.as_str())),
    };

    let mut seen = HashSet::new();
    let mut instances = Vec::with_capacity(entries.len());
    for (position, entry) in entries.into_iter().enumerate() {
        let path = format!("{task_type}[{position}]");
        let object = match to_json(entry, &path)? {
            Value::Object(object) => object,
            _ => return Err(ConfigError::new("instance must be a mapping").with_path(path)),
        };
        let instance = load_instance(task_type.clone(), object, *declaration_index, &path)?;
        if !seen.insert(instance.name.clone()) {
            return Err(ConfigError::new(format!("duplicate instance '{}'", instance.id()))
                .with_code("CONFIG-006-DUPLICATE")
                .with_path(path));
        }
        *declaration_index += 1;
        instances.push(instance);
    }

    Ok(TypeSection { task_type, instances })
}

fn take<T: serde::de::DeserializeOwned>(
    object: &mut Map<String, Value>,
    key: &str,
    path: &str,
) -> Result<Option<T>, ConfigError> {
    object
        .remove(key)
        .filter(|v| !v.is_null())
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| ConfigError::new(format!("invalid '{key}': {e}")).with_path(path))
}

fn load_instance(
    task_type: TaskType,
    mut object: Map<String, Value>,
    declaration_index: usize,
    path: &str,
) -> Result<InstanceSpec, ConfigError> {
    let name = match object.remove("name") {
        Some(Value::String(name)) if is_identifier(&name) => name,
        Some(Value::String(name)) if !name.is_empty() => {
            return Err(ConfigError::new(format!(
                "invalid instance name '{name}': use letters, digits, '_' or '-'"
            ))
            .with_code("CONFIG-007-NAME")
            .with_path(path))
        }
        _ => return Err(ConfigError::new("instance needs a non-empty string 'name'").with_path(path)),
    };
    let id = InstanceId::new(task_type.as_str(), &name);
    let path = id.to_string();

    let isolation: Option<IsolationDescriptor> = take(&mut object, "isolation", &path)?;
    let retry: Option<RetryOverride> = take(&mut object, "retry", &path)?;
    let timeout_seconds: Option<f64> = take(&mut object, "timeout_seconds", &path)?;
    let independent: Option<bool> = take(&mut object, "independent", &path)?;

    if let Some(timeout) = timeout_seconds {
        if !timeout.is_finite() || timeout < 0.0 {
            return Err(ConfigError::new("timeout_seconds must be a non-negative number").with_path(path));
        }
    }

    let raw_config = Value::Object(object);
    let template = ConfigTemplate::parse(&raw_config).map_err(|e| {
        ConfigError::new(e.to_string())
            .with_code("CONFIG-003-TOKEN")
            .with_path(&path)
    })?;

    Ok(InstanceSpec {
        task_type,
        name,
        raw_config,
        template,
        isolation: isolation.unwrap_or_default(),
        retry,
        timeout_seconds,
        independent: independent.unwrap_or(false),
        declaration_index,
    })
}
