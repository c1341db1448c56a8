//! # Desired-State Calculator
//!
//! Computes the encryption configuration every resource type should have next, given
//! the configuration instances currently run and the key objects that exist.
//!
//! Each call advances the state by at most one phase:
//!
//! 1. every resource type gets the complete readable key set,
//! 2. then every resource type switches to the newest key for writes,
//! 3. then, once that key has been migrated everywhere, read sets collapse to it.
//!
//! A phase is only returned when the previous one is already reflected in the current
//! configuration, so an instance is never told to write with a key that another
//! instance cannot read yet.

use std::collections::BTreeMap;

use super::config::{to_encryption_state, EncryptionConfiguration};
use super::{sort_recent_first, GroupResource, KeyState};

/// Desired key state per resource type
pub type DesiredState = BTreeMap<GroupResource, GroupResourceState>;

/// Keys of a single resource type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupResourceState {
    pub write_key: Option<KeyState>,
    /// Keys accepted for reads, newest first. Includes the write key.
    pub read_keys: Vec<KeyState>,
}

impl GroupResourceState {
    pub fn has_write_key(&self) -> bool {
        self.write_key.is_some()
    }

    pub fn is_write_key(&self, key: &KeyState) -> bool {
        self.write_key.as_ref().is_some_and(|w| w.same_key(key))
    }

    pub fn has_read_key(&self, key: &KeyState) -> bool {
        self.read_keys.iter().any(|k| k.same_key(key))
    }

    /// Read keys backed by a key object
    pub fn backed_read_keys(&self) -> impl Iterator<Item = &KeyState> {
        self.read_keys.iter().filter(|k| k.backed)
    }

    /// Keys referenced by the configuration without a key object behind them
    pub fn unbacked_keys(&self) -> impl Iterator<Item = &KeyState> {
        self.write_key
            .iter()
            .chain(self.read_keys.iter())
            .filter(|k| !k.backed)
    }

    /// Whether the read set, ignoring an unbacked write key, is exactly `keys`
    fn reads_match(&self, keys: &[KeyState]) -> bool {
        let considered: Vec<&KeyState> = self
            .read_keys
            .iter()
            .filter(|k| k.backed || !self.is_write_key(k))
            .collect();
        considered.len() == keys.len()
            && considered
                .iter()
                .all(|k| keys.iter().any(|other| other.same_key(k)))
    }
}

/// Compute the next desired state.
///
/// * `current` - the configuration all instances run, if any
/// * `available` - decoded key objects
/// * `requested` - resource types that should be encrypted
///
/// Resource types in `current` that are no longer requested stay in the output.
pub fn compute_desired_state(
    current: Option<&EncryptionConfiguration>,
    available: &[KeyState],
    requested: &[GroupResource],
) -> DesiredState {
    let mut keys: Vec<KeyState> = available.iter().filter(|k| k.backed).cloned().collect();
    sort_recent_first(&mut keys);
    keys.dedup_by(|a, b| a.key.name == b.key.name);

    let mut desired = current
        .map(|config| to_encryption_state(config, &keys))
        .unwrap_or_default();
    for grs in desired.values_mut() {
        sort_recent_first(&mut grs.read_keys);
    }
    for gr in requested {
        desired.entry(gr.clone()).or_default();
    }

    let readable = readable_keys(current.is_some(), &desired, &keys);
    if desired.values().any(|grs| !grs.reads_match(&readable)) {
        for grs in desired.values_mut() {
            grs.read_keys.clone_from(&readable);
        }
        return desired;
    }

    let Some(candidate) = keys.first() else {
        return desired;
    };

    let mut write_changed = false;
    for grs in desired.values_mut() {
        if !grs.is_write_key(candidate) {
            grs.write_key = Some(candidate.clone());
            write_changed = true;
        }
    }
    if write_changed {
        return desired;
    }

    if candidate.migrated.resources.is_empty() {
        return desired;
    }
    let tracked: Vec<GroupResource> = desired.keys().cloned().collect();
    if candidate.migrated.includes_all(&tracked) {
        for grs in desired.values_mut() {
            grs.read_keys = vec![candidate.clone()];
        }
    }
    desired
}

/// The key set every resource type must be able to read.
///
/// Without a configuration nothing is known about persisted data, so every key stays
/// readable. Otherwise only keys some resource type still references, plus the newest
/// key, which is how new keys enter the configuration.
fn readable_keys(
    has_config: bool,
    desired: &DesiredState,
    keys: &[KeyState],
) -> Vec<KeyState> {
    if !has_config {
        return keys.to_vec();
    }
    let mut readable: Vec<KeyState> = keys
        .iter()
        .filter(|k| desired.values().any(|grs| grs.has_read_key(k) || grs.is_write_key(k)))
        .cloned()
        .collect();
    if let Some(newest) = keys.first() {
        if !readable.iter().any(|k| k.same_key(newest)) {
            readable.insert(0, newest.clone());
        }
    }
    readable
}

/// Union of all read keys across resource types
pub fn referenced_read_keys(desired: &DesiredState) -> Vec<&KeyState> {
    let mut referenced: Vec<&KeyState> = Vec::new();
    for key in desired.values().flat_map(|grs| grs.read_keys.iter()) {
        if !referenced.iter().any(|k| k.same_key(key)) {
            referenced.push(key);
        }
    }
    referenced
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::config::from_encryption_state;
    use crate::encryption::{Key, Mode};
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    fn key(id: u64) -> KeyState {
        KeyState {
            backed: true,
            ..KeyState::unbacked(
                Key::new(id.to_string(), STANDARD.encode([id as u8; 32])),
                Mode::AesCbc,
            )
        }
    }

    fn secrets() -> GroupResource {
        GroupResource::core("secrets")
    }

    fn configmaps() -> GroupResource {
        GroupResource::core("configmaps")
    }

    fn names(keys: &[KeyState]) -> Vec<&str> {
        keys.iter().map(|k| k.key.name.as_str()).collect()
    }

    #[test]
    fn test_no_keys_no_config_seeds_requested_types() {
        let desired = compute_desired_state(None, &[], &[secrets(), configmaps()]);
        assert_eq!(desired.len(), 2);
        assert!(desired.values().all(|grs| grs == &GroupResourceState::default()));
    }

    #[test]
    fn test_first_key_becomes_readable_before_writable() {
        let keys = vec![key(1)];
        let desired = compute_desired_state(None, &keys, &[secrets()]);
        let grs = &desired[&secrets()];
        assert_eq!(names(&grs.read_keys), vec!["1"]);
        assert!(!grs.has_write_key());

        let config = from_encryption_state(&desired);
        let next = compute_desired_state(Some(&config), &keys, &[secrets()]);
        assert!(next[&secrets()].is_write_key(&key(1)));
    }

    #[test]
    fn test_unbacked_keys_dropped_from_reads() {
        let mut desired = DesiredState::new();
        desired.insert(
            secrets(),
            GroupResourceState {
                write_key: Some(key(2)),
                read_keys: vec![key(2), key(1)],
            },
        );
        let config = from_encryption_state(&desired);

        // key 1 object was deleted out of band
        let next = compute_desired_state(Some(&config), &[key(2)], &[secrets()]);
        assert_eq!(names(&next[&secrets()].read_keys), vec!["2"]);
        assert!(next[&secrets()].unbacked_keys().next().is_none());
    }

    #[test]
    fn test_unbacked_write_key_is_replaced() {
        let mut desired = DesiredState::new();
        desired.insert(
            secrets(),
            GroupResourceState {
                write_key: Some(key(5)),
                read_keys: vec![key(5)],
            },
        );
        let config = from_encryption_state(&desired);

        let step = compute_desired_state(Some(&config), &[key(6)], &[secrets()]);
        let grs = &step[&secrets()];
        assert_eq!(names(&grs.read_keys), vec!["6"]);
        assert_eq!(grs.write_key.as_ref().unwrap().key.name, "5");

        let config = from_encryption_state(&step);
        let step = compute_desired_state(Some(&config), &[key(6)], &[secrets()]);
        assert!(step[&secrets()].is_write_key(&key(6)));
    }

    #[test]
    fn test_dropped_resource_type_is_kept() {
        let keys = vec![key(1)];
        let desired = compute_desired_state(None, &keys, &[secrets(), configmaps()]);
        let config = from_encryption_state(&desired);
        let next = compute_desired_state(Some(&config), &keys, &[secrets()]);
        assert!(next.contains_key(&configmaps()));
    }

    #[test]
    fn test_referenced_read_keys_deduplicates() {
        let mut desired = DesiredState::new();
        desired.insert(
            secrets(),
            GroupResourceState {
                write_key: None,
                read_keys: vec![key(2), key(1)],
            },
        );
        desired.insert(
            configmaps(),
            GroupResourceState {
                write_key: None,
                read_keys: vec![key(2)],
            },
        );
        let referenced = referenced_read_keys(&desired);
        assert_eq!(referenced.len(), 2);
    }
}
