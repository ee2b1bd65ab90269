//! Secret vaults declared in the document's `secrets` section.

use super::path::lookup_path;
use crate::errors::ReferenceFailure;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Read-only store of secret vaults.
///
/// `Debug` output lists vault names only.
#[derive(Clone, Default, PartialEq)]
pub struct SecretStore {
    vaults: BTreeMap<String, Value>,
}

impl SecretStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a vault.
    pub fn insert_vault(&mut self, name: impl Into<String>, data: Value) {
        self.vaults.insert(name.into(), data);
    }

    /// Builder form of [`insert_vault`](Self::insert_vault).
    #[must_use]
    pub fn with_vault(mut self, name: impl Into<String>, data: Value) -> Self {
        self.insert_vault(name, data);
        self
    }

    /// Returns true if the vault exists.
    #[must_use]
    pub fn has_vault(&self, name: &str) -> bool {
        self.vaults.contains_key(name)
    }

    /// Returns the vault names.
    pub fn vault_names(&self) -> impl Iterator<Item = &str> {
        self.vaults.keys().map(String::as_str)
    }

    /// Looks up a dot path inside a vault.
    pub(crate) fn lookup(&self, vault: &str, path: &str) -> Result<&Value, ReferenceFailure> {
        let data = self.vaults.get(vault).ok_or(ReferenceFailure::UnknownVault)?;
        lookup_path(data, path.split('.')).ok_or(ReferenceFailure::UnknownKey)
    }
}

impl fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretStore")
            .field("vaults", &self.vaults.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> SecretStore {
        SecretStore::new().with_vault(
            "hello-world",
            json!({"proxmox_password": "abc", "ssh": {"keys": ["k0", "k1"]}}),
        )
    }

    #[test]
    fn test_lookup_nested_and_indexed() {
        let store = store();
        assert_eq!(store.lookup("hello-world", "proxmox_password"), Ok(&json!("abc")));
        assert_eq!(store.lookup("hello-world", "ssh.keys.1"), Ok(&json!("k1")));
    }

    #[test]
    fn test_lookup_failures() {
        let store = store();
        assert_eq!(store.lookup("missing", "x"), Err(ReferenceFailure::UnknownVault));
        assert_eq!(store.lookup("hello-world", "nope"), Err(ReferenceFailure::UnknownKey));
    }

    #[test]
    fn test_debug_redacts_values() {
        let rendered = format!("{:?}", store());
        assert!(rendered.contains("hello-world"));
        assert!(!rendered.contains("abc"));
    }
}
