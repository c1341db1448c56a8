//! # Key State
//!
//! In-memory view of a single encryption key and its lifecycle progress.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{GroupResource, Mode};

/// A named key as it appears in an `EncryptionConfiguration` provider.
///
/// `name` is the decimal key ID, `secret` the base64 encoded key material.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Key {
    pub name: String,
    pub secret: String,
}

impl Key {
    pub fn new(name: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("name", &self.name)
            .field("secret", &"***")
            .finish()
    }
}

/// Migration progress recorded on a key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationState {
    /// When the last migration under this key finished
    pub timestamp: Option<DateTime<Utc>>,
    /// Resource types whose stored objects were rewritten with this key
    pub resources: Vec<GroupResource>,
}

impl MigrationState {
    pub fn includes(&self, gr: &GroupResource) -> bool {
        self.resources.contains(gr)
    }

    pub fn includes_all(&self, grs: &[GroupResource]) -> bool {
        grs.iter().all(|gr| self.includes(gr))
    }
}

/// Lifecycle state of a key.
///
/// Keys resolved from a configuration without a matching key object are `backed == false`
/// and only carry `key` and `mode`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyState {
    pub key: Key,
    pub mode: Mode,
    pub backed: bool,
    pub migrated: MigrationState,
    pub read_observed: Option<DateTime<Utc>>,
    pub write_observed: Option<DateTime<Utc>>,
    /// Why the controller minted this key
    pub internal_reason: String,
    /// Administrator supplied reason current when the key was minted
    pub external_reason: String,
}

impl KeyState {
    /// A key found in a configuration that no key object backs
    pub fn unbacked(key: Key, mode: Mode) -> Self {
        Self {
            key,
            mode,
            backed: false,
            migrated: MigrationState::default(),
            read_observed: None,
            write_observed: None,
            internal_reason: String::new(),
            external_reason: String::new(),
        }
    }

    /// Numeric key ID parsed from the key name
    pub fn key_id(&self) -> Option<u64> {
        self.key.name.parse().ok()
    }

    /// Same name and the same material
    pub fn same_key(&self, other: &KeyState) -> bool {
        self.key == other.key
    }
}

/// Sort keys by key ID, newest first. Keys without a numeric ID go last.
pub fn sort_recent_first(keys: &mut [KeyState]) {
    keys.sort_by(|a, b| b.key_id().cmp(&a.key_id()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> KeyState {
        KeyState::unbacked(Key::new(id, "c2VjcmV0"), Mode::AesCbc)
    }

    #[test]
    fn test_sort_recent_first() {
        let mut keys = vec![key("2"), key("10"), key("bogus"), key("7")];
        sort_recent_first(&mut keys);
        let names: Vec<_> = keys.iter().map(|k| k.key.name.as_str()).collect();
        assert_eq!(names, vec!["10", "7", "2", "bogus"]);
    }

    #[test]
    fn test_key_debug_redacts_material() {
        let rendered = format!("{:?}", Key::new("1", "c2VjcmV0"));
        assert!(!rendered.contains("c2VjcmV0"));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn test_migration_state_includes_all() {
        let state = MigrationState {
            timestamp: None,
            resources: vec![GroupResource::core("secrets")],
        };
        assert!(state.includes_all(&[GroupResource::core("secrets")]));
        assert!(!state.includes_all(&[
            GroupResource::core("secrets"),
            GroupResource::core("configmaps")
        ]));
    }
}
