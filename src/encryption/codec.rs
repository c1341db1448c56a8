//! # Key Secret Codec
//!
//! Encodes keys and their lifecycle metadata into Kubernetes Secrets and back.
//!
//! Decoding never panics. An object that fails to decode is reported as a
//! [`KeyDecodeError`] and callers treat it as absent, so a key written by a newer
//! controller with an unknown mode is ignored rather than blocking everything else.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{GroupResource, Key, KeyState, MigrationState, Mode, UnknownModeError};
use crate::constants::{
    ANNOTATION_DESCRIPTION, ANNOTATION_EXTERNAL_REASON, ANNOTATION_INTERNAL_REASON,
    ANNOTATION_MIGRATED_RESOURCES, ANNOTATION_MIGRATED_TIMESTAMP, ANNOTATION_MODE,
    ANNOTATION_READ_TIMESTAMP, ANNOTATION_WRITE_TIMESTAMP, KEY_DATA_KEY, KEY_FINALIZER,
    LABEL_COMPONENT, LABEL_GROUP, LABEL_RESOURCE,
};

const KEY_DESCRIPTION: &str = "WARNING: DO NOT EDIT.\n\
Altering of the encryption secrets will render you cluster inaccessible.\n\
Catastrophic data loss can occur from the most minor changes.";

/// Errors while turning an in-memory key into a Secret
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("key name {0:?} is not a numeric key ID")]
    InvalidKeyName(String),
    #[error("key material of key {name} is not valid base64: {source}")]
    InvalidMaterial {
        name: String,
        source: base64::DecodeError,
    },
    #[error("failed to serialize migrated resources: {0}")]
    MigratedResources(#[from] serde_json::Error),
}

/// Reasons a Secret is not a usable key object
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyDecodeError {
    #[error("secret has no name")]
    MissingName,
    #[error("missing label {0}")]
    MissingLabel(&'static str),
    #[error("secret {0} has no key material")]
    EmptyMaterial(String),
    #[error("secret name {0} does not end with a numeric key ID")]
    InvalidKeyId(String),
    #[error("missing mode annotation")]
    MissingMode,
    #[error(transparent)]
    UnknownMode(#[from] UnknownModeError),
    #[error("annotation {annotation} has invalid timestamp {value:?}")]
    InvalidTimestamp {
        annotation: &'static str,
        value: String,
    },
    #[error("migrated resources annotation is not valid: {0}")]
    InvalidMigratedResources(String),
}

/// A successfully decoded key object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedKey {
    /// Resource type the key was minted for
    pub group_resource: GroupResource,
    pub key_id: u64,
    pub state: KeyState,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MigratedResources {
    resources: Vec<GroupResource>,
}

/// `<component>-<group|core>-<resource>-encryption-<keyID>`
pub fn key_secret_name(component: &str, gr: &GroupResource, key_id: u64) -> String {
    format!(
        "{component}-{}-{}-encryption-{key_id}",
        gr.group_or_core(),
        gr.resource
    )
}

/// Label selector matching every key object of a component
pub fn component_selector(component: &str) -> String {
    format!("{LABEL_COMPONENT}={component}")
}

/// Encode a key as a guarded Secret in `namespace`
pub fn encode(
    component: &str,
    namespace: &str,
    gr: &GroupResource,
    state: &KeyState,
) -> Result<Secret, CodecError> {
    let key_id = state
        .key_id()
        .ok_or_else(|| CodecError::InvalidKeyName(state.key.name.clone()))?;
    let material = STANDARD
        .decode(&state.key.secret)
        .map_err(|source| CodecError::InvalidMaterial {
            name: state.key.name.clone(),
            source,
        })?;

    let labels = BTreeMap::from([
        (LABEL_COMPONENT.to_string(), component.to_string()),
        (LABEL_GROUP.to_string(), gr.group.clone()),
        (LABEL_RESOURCE.to_string(), gr.resource.clone()),
    ]);

    let mut annotations = BTreeMap::from([
        (ANNOTATION_MODE.to_string(), state.mode.to_string()),
        (ANNOTATION_DESCRIPTION.to_string(), KEY_DESCRIPTION.to_string()),
    ]);
    if let Some(ts) = state.read_observed {
        annotations.insert(ANNOTATION_READ_TIMESTAMP.to_string(), format_timestamp(ts));
    }
    if let Some(ts) = state.write_observed {
        annotations.insert(ANNOTATION_WRITE_TIMESTAMP.to_string(), format_timestamp(ts));
    }
    if let Some(ts) = state.migrated.timestamp {
        annotations.insert(
            ANNOTATION_MIGRATED_TIMESTAMP.to_string(),
            format_timestamp(ts),
        );
    }
    if !state.migrated.resources.is_empty() {
        let value = serde_json::to_string(&MigratedResources {
            resources: state.migrated.resources.clone(),
        })?;
        annotations.insert(ANNOTATION_MIGRATED_RESOURCES.to_string(), value);
    }
    if !state.internal_reason.is_empty() {
        annotations.insert(
            ANNOTATION_INTERNAL_REASON.to_string(),
            state.internal_reason.clone(),
        );
    }
    if !state.external_reason.is_empty() {
        annotations.insert(
            ANNOTATION_EXTERNAL_REASON.to_string(),
            state.external_reason.clone(),
        );
    }

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(key_secret_name(component, gr, key_id)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            finalizers: Some(vec![KEY_FINALIZER.to_string()]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            KEY_DATA_KEY.to_string(),
            ByteString(material),
        )])),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    })
}

/// Decode a key object
pub fn decode(secret: &Secret) -> Result<DecodedKey, KeyDecodeError> {
    let name = secret
        .metadata
        .name
        .as_deref()
        .ok_or(KeyDecodeError::MissingName)?;

    let labels = secret.metadata.labels.as_ref();
    let label = |key: &'static str| {
        labels
            .and_then(|l| l.get(key))
            .ok_or(KeyDecodeError::MissingLabel(key))
    };
    label(LABEL_COMPONENT)?;
    let group = label(LABEL_GROUP)?;
    let resource = label(LABEL_RESOURCE)?;
    if resource.is_empty() {
        return Err(KeyDecodeError::MissingLabel(LABEL_RESOURCE));
    }

    let key_id = name
        .rsplit_once('-')
        .and_then(|(_, id)| id.parse::<u64>().ok())
        .ok_or_else(|| KeyDecodeError::InvalidKeyId(name.to_string()))?;

    let material = secret
        .data
        .as_ref()
        .and_then(|d| d.get(KEY_DATA_KEY))
        .filter(|m| !m.0.is_empty())
        .ok_or_else(|| KeyDecodeError::EmptyMaterial(name.to_string()))?;

    let annotations = secret.metadata.annotations.as_ref();
    let annotation = |key: &str| annotations.and_then(|a| a.get(key)).map(String::as_str);

    let mode: Mode = annotation(ANNOTATION_MODE)
        .ok_or(KeyDecodeError::MissingMode)?
        .parse()?;

    let migrated_resources = match annotation(ANNOTATION_MIGRATED_RESOURCES) {
        Some(raw) if !raw.is_empty() => serde_json::from_str::<MigratedResources>(raw)
            .map_err(|e| KeyDecodeError::InvalidMigratedResources(e.to_string()))?
            .resources,
        _ => Vec::new(),
    };

    let timestamp = |key: &'static str| parse_timestamp(key, annotation(key));

    let state = KeyState {
        key: Key::new(key_id.to_string(), STANDARD.encode(&material.0)),
        mode,
        backed: true,
        migrated: MigrationState {
            timestamp: timestamp(ANNOTATION_MIGRATED_TIMESTAMP)?,
            resources: migrated_resources,
        },
        read_observed: timestamp(ANNOTATION_READ_TIMESTAMP)?,
        write_observed: timestamp(ANNOTATION_WRITE_TIMESTAMP)?,
        internal_reason: annotation(ANNOTATION_INTERNAL_REASON)
            .unwrap_or_default()
            .to_string(),
        external_reason: annotation(ANNOTATION_EXTERNAL_REASON)
            .unwrap_or_default()
            .to_string(),
    };

    Ok(DecodedKey {
        group_resource: GroupResource::new(group.clone(), resource.clone()),
        key_id,
        state,
    })
}

/// Set a timestamp annotation unless it is already present. Returns whether the secret changed.
pub fn stamp_if_absent(secret: &mut Secret, annotation: &str, now: DateTime<Utc>) -> bool {
    let annotations = secret.metadata.annotations.get_or_insert_with(BTreeMap::new);
    if annotations.get(annotation).is_some_and(|v| !v.is_empty()) {
        return false;
    }
    annotations.insert(annotation.to_string(), format_timestamp(now));
    true
}

/// Record that `gr` was migrated under this key, keeping resource types recorded earlier.
///
/// Returns whether the secret changed.
pub fn record_migration(
    secret: &mut Secret,
    gr: &GroupResource,
    now: DateTime<Utc>,
) -> Result<bool, KeyDecodeError> {
    let annotations = secret.metadata.annotations.get_or_insert_with(BTreeMap::new);
    let mut recorded = match annotations.get(ANNOTATION_MIGRATED_RESOURCES) {
        Some(raw) if !raw.is_empty() => serde_json::from_str::<MigratedResources>(raw)
            .map_err(|e| KeyDecodeError::InvalidMigratedResources(e.to_string()))?,
        _ => MigratedResources::default(),
    };
    if recorded.resources.contains(gr) && annotations.contains_key(ANNOTATION_MIGRATED_TIMESTAMP) {
        return Ok(false);
    }
    if !recorded.resources.contains(gr) {
        recorded.resources.push(gr.clone());
    }
    let value = serde_json::to_string(&recorded)
        .map_err(|e| KeyDecodeError::InvalidMigratedResources(e.to_string()))?;
    annotations.insert(ANNOTATION_MIGRATED_RESOURCES.to_string(), value);
    annotations.insert(
        ANNOTATION_MIGRATED_TIMESTAMP.to_string(),
        format_timestamp(now),
    );
    Ok(true)
}

pub fn has_deletion_guard(secret: &Secret) -> bool {
    secret
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|name| name == KEY_FINALIZER))
}

/// Remove the deletion guard. Returns whether the secret changed.
pub fn remove_deletion_guard(secret: &mut Secret) -> bool {
    let Some(finalizers) = secret.metadata.finalizers.as_mut() else {
        return false;
    };
    let before = finalizers.len();
    finalizers.retain(|name| name != KEY_FINALIZER);
    before != finalizers.len()
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_timestamp(
    annotation: &'static str,
    value: Option<&str>,
) -> Result<Option<DateTime<Utc>>, KeyDecodeError> {
    match value {
        None | Some("") => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|_| KeyDecodeError::InvalidTimestamp {
                annotation,
                value: raw.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn full_state(mode: Mode) -> KeyState {
        KeyState {
            key: Key::new("7", STANDARD.encode(mode.generate_key())),
            mode,
            backed: true,
            migrated: MigrationState {
                timestamp: Some(ts(1_700_000_000)),
                resources: vec![GroupResource::core("secrets"), GroupResource::core("configmaps")],
            },
            read_observed: Some(ts(1_699_000_000)),
            write_observed: Some(ts(1_699_500_000)),
            internal_reason: "timestamp-too-old".to_string(),
            external_reason: "rotate-after-incident".to_string(),
        }
    }

    #[test]
    fn test_round_trip_all_modes() {
        let gr = GroupResource::core("secrets");
        for mode in [Mode::AesCbc, Mode::SecretBox, Mode::Identity] {
            let state = full_state(mode);
            let secret = encode("kube-apiserver", "keys", &gr, &state).unwrap();
            let decoded = decode(&secret).unwrap();
            assert_eq!(decoded.state, state, "mode {mode} did not round trip");
            assert_eq!(decoded.key_id, 7);
            assert_eq!(decoded.group_resource, gr);
        }
    }

    #[test]
    fn test_minimal_key_round_trips() {
        let gr = GroupResource::new("route.openshift.io", "routes");
        let state = KeyState {
            backed: true,
            ..KeyState::unbacked(Key::new("1", STANDARD.encode([1u8; 32])), Mode::AesCbc)
        };
        let secret = encode("kube-apiserver", "keys", &gr, &state).unwrap();
        assert_eq!(
            secret.metadata.name.as_deref(),
            Some("kube-apiserver-route.openshift.io-routes-encryption-1")
        );
        assert_eq!(decode(&secret).unwrap().state, state);
    }

    #[test]
    fn test_encoded_secret_is_guarded_and_labelled() {
        let gr = GroupResource::core("configmaps");
        let secret = encode("kube-apiserver", "keys", &gr, &full_state(Mode::AesCbc)).unwrap();
        assert_eq!(
            secret.metadata.name.as_deref(),
            Some("kube-apiserver-core-configmaps-encryption-7")
        );
        assert!(has_deletion_guard(&secret));
        let labels = secret.metadata.labels.unwrap();
        assert_eq!(labels[LABEL_GROUP], "");
        assert_eq!(labels[LABEL_RESOURCE], "configmaps");
    }

    #[test]
    fn test_decode_rejects_missing_labels() {
        let gr = GroupResource::core("secrets");
        let mut secret = encode("c", "ns", &gr, &full_state(Mode::AesCbc)).unwrap();
        secret.metadata.labels.as_mut().unwrap().remove(LABEL_RESOURCE);
        assert_eq!(
            decode(&secret),
            Err(KeyDecodeError::MissingLabel(LABEL_RESOURCE))
        );
    }

    #[test]
    fn test_decode_rejects_empty_material() {
        let gr = GroupResource::core("secrets");
        let mut secret = encode("c", "ns", &gr, &full_state(Mode::AesCbc)).unwrap();
        secret
            .data
            .as_mut()
            .unwrap()
            .insert(KEY_DATA_KEY.to_string(), ByteString(Vec::new()));
        assert!(matches!(
            decode(&secret),
            Err(KeyDecodeError::EmptyMaterial(_))
        ));
    }

    #[test]
    fn test_decode_rejects_non_numeric_suffix() {
        let gr = GroupResource::core("secrets");
        let mut secret = encode("c", "ns", &gr, &full_state(Mode::AesCbc)).unwrap();
        secret.metadata.name = Some("c-core-secrets-encryption-latest".to_string());
        assert!(matches!(
            decode(&secret),
            Err(KeyDecodeError::InvalidKeyId(_))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_mode() {
        let gr = GroupResource::core("secrets");
        let mut secret = encode("c", "ns", &gr, &full_state(Mode::AesCbc)).unwrap();
        secret
            .metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert(ANNOTATION_MODE.to_string(), "kms".to_string());
        assert_eq!(
            decode(&secret),
            Err(KeyDecodeError::UnknownMode(UnknownModeError("kms".to_string())))
        );
    }

    #[test]
    fn test_decode_rejects_bad_timestamp() {
        let gr = GroupResource::core("secrets");
        let mut secret = encode("c", "ns", &gr, &full_state(Mode::AesCbc)).unwrap();
        secret
            .metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert(ANNOTATION_READ_TIMESTAMP.to_string(), "yesterday".to_string());
        assert!(matches!(
            decode(&secret),
            Err(KeyDecodeError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn test_stamp_if_absent_is_idempotent() {
        let mut secret = Secret::default();
        assert!(stamp_if_absent(&mut secret, ANNOTATION_READ_TIMESTAMP, ts(10)));
        assert!(!stamp_if_absent(&mut secret, ANNOTATION_READ_TIMESTAMP, ts(20)));
        assert_eq!(
            secret.metadata.annotations.unwrap()[ANNOTATION_READ_TIMESTAMP],
            "1970-01-01T00:00:10Z"
        );
    }

    #[test]
    fn test_record_migration_unions_resources() {
        let gr = GroupResource::core("secrets");
        let mut state = full_state(Mode::AesCbc);
        state.migrated = MigrationState {
            timestamp: Some(ts(100)),
            resources: vec![GroupResource::core("configmaps")],
        };
        let mut secret = encode("c", "ns", &gr, &state).unwrap();

        assert_eq!(record_migration(&mut secret, &gr, ts(200)), Ok(true));
        assert_eq!(record_migration(&mut secret, &gr, ts(300)), Ok(false));

        let decoded = decode(&secret).unwrap();
        assert_eq!(
            decoded.state.migrated.resources,
            vec![GroupResource::core("configmaps"), GroupResource::core("secrets")]
        );
        assert_eq!(decoded.state.migrated.timestamp, Some(ts(200)));
    }

    #[test]
    fn test_remove_deletion_guard() {
        let gr = GroupResource::core("secrets");
        let mut secret = encode("c", "ns", &gr, &full_state(Mode::AesCbc)).unwrap();
        assert!(remove_deletion_guard(&mut secret));
        assert!(!has_deletion_guard(&secret));
        assert!(!remove_deletion_guard(&mut secret));
    }
}
