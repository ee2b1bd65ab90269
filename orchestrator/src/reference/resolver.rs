//! Substitution of reference tokens immediately before dispatch.

use super::path::step;
use super::secrets::SecretStore;
use super::template::ConfigTemplate;
use super::token::ReferenceToken;
use crate::config::InstanceId;
use crate::errors::{ReferenceError, ReferenceFailure};
use crate::state::StateSnapshot;
use serde_json::Value;
use tracing::debug;

/// Resolves templates against the secrets and a state snapshot.
///
/// The snapshot only ever holds succeeded instances, so a group reference
/// to anything else fails with [`ReferenceFailure::NotYetSucceeded`].
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'a> {
    secrets: &'a SecretStore,
    snapshot: &'a StateSnapshot,
}

impl<'a> Resolver<'a> {
    /// Creates a resolver over borrowed state.
    #[must_use]
    pub fn new(secrets: &'a SecretStore, snapshot: &'a StateSnapshot) -> Self {
        Self { secrets, snapshot }
    }

    /// Produces the concrete configuration for `requester`.
    pub fn resolve(&self, requester: &InstanceId, template: &ConfigTemplate) -> Result<Value, ReferenceError> {
        template.render(&mut |token| self.resolve_token(requester, token))
    }

    /// Resolves a single token.
    pub fn resolve_token(&self, requester: &InstanceId, token: &ReferenceToken) -> Result<Value, ReferenceError> {
        let fail = |reason: ReferenceFailure, message: String| {
            ReferenceError::new(token.to_string(), requester.to_string(), reason, message)
        };

        match token {
            ReferenceToken::Secret { vault, path } => {
                self.secrets.lookup(vault, path).cloned().map_err(|reason| match reason {
                    ReferenceFailure::UnknownVault => fail(reason, format!("no secrets vault named '{vault}'")),
                    _ => fail(reason, format!("vault '{vault}' has no value at '{path}'")),
                })
            }
            ReferenceToken::Group {
                source_type,
                source_instance,
                group,
                node,
            } => {
                let source = InstanceId::new(source_type, source_instance);
                let outputs = self.snapshot.outputs(&source).ok_or_else(|| {
                    fail(
                        ReferenceFailure::NotYetSucceeded,
                        format!("'{source}' has not succeeded"),
                    )
                })?;
                let group_value = outputs.get(group).ok_or_else(|| {
                    fail(
                        ReferenceFailure::UnknownGroup,
                        format!("'{source}' exported no output group '{group}'"),
                    )
                })?;
                let value = match node {
                    None => group_value,
                    Some(node) => step(group_value, node).ok_or_else(|| {
                        fail(
                            ReferenceFailure::UnknownNode,
                            format!("group '{group}' of '{source}' has no node '{node}'"),
                        )
                    })?,
                };
                debug!(requester = %requester, token = %token, "Resolved group reference");
                Ok(value.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PipelineStateStore;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Map};

    fn outputs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(m) => m,
            _ => Map::new(),
        }
    }

    fn fixture() -> (SecretStore, PipelineStateStore) {
        let secrets = SecretStore::new().with_vault("hello-world", json!({"proxmox_password": "abc"}));
        let mut store = PipelineStateStore::new();
        store
            .store(
                &InstanceId::new("terraform", "proxmox"),
                1,
                outputs(json!({
                    "master": [{"name": "master-01", "ip": "10.0.0.10"}],
                    "network": {"gateway": "10.0.0.1"},
                })),
                Map::new(),
            )
            .unwrap();
        (secrets, store)
    }

    #[test]
    fn test_resolve_secret_and_group() {
        let (secrets, store) = fixture();
        let snapshot = store.snapshot();
        let resolver = Resolver::new(&secrets, &snapshot);

        let template = ConfigTemplate::parse(&json!({
            "vars": {"pm_password": "_secret:hello-world:proxmox_password"},
            "host": "_group:terraform:proxmox:master:master-01",
            "gateway": "_group:terraform:proxmox:network:gateway",
        }))
        .unwrap();

        let resolved = resolver
            .resolve(&InstanceId::new("ansible", "site"), &template)
            .unwrap();
        assert_eq!(
            resolved,
            json!({
                "vars": {"pm_password": "abc"},
                "host": {"name": "master-01", "ip": "10.0.0.10"},
                "gateway": "10.0.0.1",
            })
        );
    }

    #[test]
    fn test_reference_to_unfinished_instance() {
        let (secrets, _) = fixture();
        let empty = PipelineStateStore::new().snapshot();
        let resolver = Resolver::new(&secrets, &empty);
        let template = ConfigTemplate::parse(&json!("_group:terraform:proxmox:master")).unwrap();

        let err = resolver
            .resolve(&InstanceId::new("ansible", "site"), &template)
            .unwrap_err();
        assert_eq!(err.reason, ReferenceFailure::NotYetSucceeded);
        assert_eq!(err.requester, "ansible.site");
        assert_eq!(err.token, "_group:terraform:proxmox:master");
    }

    #[test]
    fn test_unknown_group_and_node() {
        let (secrets, store) = fixture();
        let snapshot = store.snapshot();
        let resolver = Resolver::new(&secrets, &snapshot);
        let me = InstanceId::new("shell", "x");

        let group = ConfigTemplate::parse(&json!("_group:terraform:proxmox:workers")).unwrap();
        assert_eq!(resolver.resolve(&me, &group).unwrap_err().reason, ReferenceFailure::UnknownGroup);

        let node = ConfigTemplate::parse(&json!("_group:terraform:proxmox:master:master-09")).unwrap();
        assert_eq!(resolver.resolve(&me, &node).unwrap_err().reason, ReferenceFailure::UnknownNode);
    }

    #[test]
    fn test_unknown_vault_and_key() {
        let (secrets, store) = fixture();
        let snapshot = store.snapshot();
        let resolver = Resolver::new(&secrets, &snapshot);
        let me = InstanceId::new("shell", "x");

        let vault = ConfigTemplate::parse(&json!("_secret:other:key")).unwrap();
        assert_eq!(resolver.resolve(&me, &vault).unwrap_err().reason, ReferenceFailure::UnknownVault);

        let key = ConfigTemplate::parse(&json!("_secret:hello-world:missing")).unwrap();
        assert_eq!(resolver.resolve(&me, &key).unwrap_err().reason, ReferenceFailure::UnknownKey);
    }
}
