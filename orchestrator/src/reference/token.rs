//! Reference token grammar.
//!
//! Two forms are recognised, each spanning an entire string value:
//!
//! - `_secret:<vault>:<dot.separated.path>`
//! - `_group:<type>:<instance>:<group>[:<node>]`

use crate::config::InstanceId;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

/// Prefix of secret references.
pub const SECRET_PREFIX: &str = "_secret:";
/// Prefix of group references.
pub const GROUP_PREFIX: &str = "_group:";

#[allow(clippy::expect_used)]
static SECRET_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^_secret:([\w-]+):([\w-]+(?:\.[\w-]+)*)$").expect("secret pattern is a valid regex")
});

#[allow(clippy::expect_used)]
static GROUP_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^_group:([\w-]+):([\w-]+):([\w-]+)(?::([\w-]+))?$").expect("group pattern is a valid regex")
});

/// A string carried a reference prefix but did not match its grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed reference '{raw}': expected {expected}")]
pub struct TokenParseError {
    /// The offending value.
    pub raw: String,
    /// The grammar that was expected.
    pub expected: &'static str,
}

/// A parsed cross-task or secret reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReferenceToken {
    /// A value from a secrets vault.
    Secret {
        /// Vault name.
        vault: String,
        /// Dot-separated path inside the vault.
        path: String,
    },
    /// An output group of another instance.
    Group {
        /// Task type of the producing instance.
        source_type: String,
        /// Name of the producing instance.
        source_instance: String,
        /// Output group name.
        group: String,
        /// Optional node within the group.
        node: Option<String>,
    },
}

impl ReferenceToken {
    /// Parses a string value.
    ///
    /// Returns `Ok(None)` for plain strings. Strings starting with a
    /// reference prefix must match the grammar exactly.
    pub fn parse(raw: &str) -> Result<Option<Self>, TokenParseError> {
        if raw.starts_with(SECRET_PREFIX) {
            let caps = SECRET_PATTERN.captures(raw).ok_or_else(|| TokenParseError {
                raw: raw.to_string(),
                expected: "_secret:<vault>:<dot.path>",
            })?;
            return Ok(Some(Self::Secret {
                vault: caps[1].to_string(),
                path: caps[2].to_string(),
            }));
        }

        if raw.starts_with(GROUP_PREFIX) {
            let caps = GROUP_PATTERN.captures(raw).ok_or_else(|| TokenParseError {
                raw: raw.to_string(),
                expected: "_group:<type>:<instance>:<group>[:<node>]",
            })?;
            return Ok(Some(Self::Group {
                source_type: caps[1].to_string(),
                source_instance: caps[2].to_string(),
                group: caps[3].to_string(),
                node: caps.get(4).map(|m| m.as_str().to_string()),
            }));
        }

        Ok(None)
    }

    /// Returns the producing instance for group references.
    #[must_use]
    pub fn source(&self) -> Option<InstanceId> {
        match self {
            Self::Group {
                source_type,
                source_instance,
                ..
            } => Some(InstanceId::new(source_type, source_instance)),
            Self::Secret { .. } => None,
        }
    }
}

impl fmt::Display for ReferenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Secret { vault, path } => write!(f, "{SECRET_PREFIX}{vault}:{path}"),
            Self::Group {
                source_type,
                source_instance,
                group,
                node,
            } => {
                write!(f, "{GROUP_PREFIX}{source_type}:{source_instance}:{group}")?;
                if let Some(node) = node {
                    write!(f, ":{node}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_plain_strings_are_not_tokens() {
        assert_eq!(ReferenceToken::parse("ubuntu:22.04").unwrap(), None);
        assert_eq!(ReferenceToken::parse("see _group:a:b:c").unwrap(), None);
        assert_eq!(ReferenceToken::parse("").unwrap(), None);
    }

    #[test]
    fn test_parse_secret() {
        let token = ReferenceToken::parse("_secret:hello-world:proxmox.password")
            .unwrap()
            .unwrap();
        assert_eq!(
            token,
            ReferenceToken::Secret {
                vault: "hello-world".to_string(),
                path: "proxmox.password".to_string(),
            }
        );
        assert_eq!(token.source(), None);
    }

    #[test]
    fn test_parse_group_with_node() {
        let token = ReferenceToken::parse("_group:terraform:proxmox:master:master-01")
            .unwrap()
            .unwrap();
        assert_eq!(token.source(), Some(InstanceId::new("terraform", "proxmox")));
        assert_eq!(token.to_string(), "_group:terraform:proxmox:master:master-01");
    }

    #[test]
    fn test_parse_group_without_node() {
        let token = ReferenceToken::parse("_group:terraform:proxmox:workers")
            .unwrap()
            .unwrap();
        match token {
            ReferenceToken::Group { group, node, .. } => {
                assert_eq!(group, "workers");
                assert_eq!(node, None);
            }
            ReferenceToken::Secret { .. } => panic!("expected group token"),
        }
    }

    #[test]
    fn test_malformed_tokens_rejected() {
        assert!(ReferenceToken::parse("_group:terraform:proxmox").is_err());
        assert!(ReferenceToken::parse("_secret:vault").is_err());
        assert!(ReferenceToken::parse("_secret:vault:a..b").is_err());
        assert!(ReferenceToken::parse("_group:a:b:c:d:e").is_err());
    }
}
