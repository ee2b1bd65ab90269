//! Validated identifiers for task types and instances.

use crate::errors::ConfigError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Top-level document keys that never name a task type.
pub const RESERVED_SECTIONS: &[&str] = &["core", "secrets"];

/// Letters, digits, `_` and `-`: the characters a reference token can name
/// and a state file name can carry.
pub(crate) fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// A validated task type name (a section key in the pipeline document).
///
/// Dashes are not allowed: packages map the dashes in their name suffix to
/// underscores, so a dashed section could never match a package.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    /// Validates and wraps a type name.
    pub fn new(name: impl Into<String>) -> Result<Self, ConfigError> {
        let name = name.into();
        if !is_identifier(&name) || name.contains('-') {
            return Err(ConfigError::new(format!(
                "invalid task type '{name}': use letters, digits or '_'"
            ))
            .with_fix_hint(format!("Rename the section to '{}'.", name.replace('-', "_"))));
        }
        if RESERVED_SECTIONS.contains(&name.as_str()) {
            return Err(ConfigError::new(format!("'{name}' is a reserved section name")));
        }
        Ok(Self(name))
    }

    /// Returns the type name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TaskType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

/// Qualified instance identifier, rendered as `<type>.<name>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId {
    task_type: String,
    name: String,
}

impl InstanceId {
    /// Creates an instance id from its parts.
    #[must_use]
    pub fn new(task_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            name: name.into(),
        }
    }

    /// Returns the task type part.
    #[must_use]
    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    /// Returns the instance name part.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.task_type, self.name)
    }
}

impl FromStr for InstanceId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((task_type, name)) if is_identifier(task_type) && !name.is_empty() => {
                Ok(Self::new(task_type, name))
            }
            _ => Err(ConfigError::new(format!(
                "invalid instance id '{s}': expected '<type>.<name>'"
            ))),
        }
    }
}

impl Serialize for InstanceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for InstanceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_type_validation() {
        assert!(TaskType::new("terraform").is_ok());
        assert!(TaskType::new("cloud_init").is_ok());
        assert!(TaskType::new("").is_err());
        assert!(TaskType::new("has space").is_err());
        assert!(TaskType::new("cloud-init").is_err());
        assert!(TaskType::new("core").is_err());
        assert!(TaskType::new("secrets").is_err());
    }

    #[test]
    fn test_instance_id_display_and_parse() {
        let id = InstanceId::new("terraform", "proxmox");
        assert_eq!(id.to_string(), "terraform.proxmox");

        let parsed: InstanceId = "terraform.proxmox".parse().unwrap();
        assert_eq!(parsed, id);

        // Names may contain dots; only the first separates the type.
        let dotted: InstanceId = "shell.step.one".parse().unwrap();
        assert_eq!(dotted.name(), "step.one");

        assert!("noseparator".parse::<InstanceId>().is_err());
    }

    #[test]
    fn test_instance_id_serializes_as_string() {
        let id = InstanceId::new("ansible", "site");
        let json = serde_json::to_value(&id).unwrap();
        assert_eq!(json, serde_json::json!("ansible.site"));
        let back: InstanceId = serde_json::from_value(json).unwrap();
        assert_eq!(back, id);
    }
}
