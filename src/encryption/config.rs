//! # Encryption Configuration
//!
//! The `apiserver.config.k8s.io/v1` `EncryptionConfiguration` consumed by API server
//! instances, plus conversion to and from per-resource key state.
//!
//! Provider order is the contract with the API server: the first provider encrypts
//! writes and every provider is tried in order on reads. Identity keys cannot be
//! expressed directly, so they travel as `aesgcm` "carrier" providers placed after
//! everything else, with an `identity` provider taking their place in the list.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::state::{DesiredState, GroupResourceState};
use super::{GroupResource, Key, KeyState, Mode};
use crate::constants::{ENCRYPTION_CONFIG_DATA_KEY, ENCRYPTION_CONFIG_SECRET_PREFIX};

pub const API_VERSION: &str = "apiserver.config.k8s.io/v1";
pub const KIND: &str = "EncryptionConfiguration";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("secret {0} has no encryption-config data")]
    MissingData(String),
    #[error("failed to parse encryption configuration in secret {name}: {source}")]
    Parse {
        name: String,
        source: serde_json::Error,
    },
    #[error("failed to serialize encryption configuration: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionConfiguration {
    pub kind: String,
    pub api_version: String,
    pub resources: Vec<ResourceConfiguration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfiguration {
    pub resources: Vec<String>,
    pub providers: Vec<Provider>,
}

/// One entry of a provider list. Serializes as `{"aescbc": {"keys": [...]}}` etc.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Aescbc(KeyConfiguration),
    Secretbox(KeyConfiguration),
    Aesgcm(KeyConfiguration),
    Identity(IdentityConfiguration),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyConfiguration {
    pub keys: Vec<Key>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConfiguration {}

impl Provider {
    fn single(mode: Mode, key: Key) -> Self {
        let keys = KeyConfiguration { keys: vec![key] };
        match mode {
            Mode::AesCbc => Provider::Aescbc(keys),
            Mode::SecretBox => Provider::Secretbox(keys),
            // identity keys ride in an aesgcm carrier
            Mode::Identity => Provider::Aesgcm(keys),
        }
    }
}

impl EncryptionConfiguration {
    pub fn new(resources: Vec<ResourceConfiguration>) -> Self {
        Self {
            kind: KIND.to_string(),
            api_version: API_VERSION.to_string(),
            resources,
        }
    }
}

/// Serialize a desired state. Resource entries are sorted by their string form.
pub fn from_encryption_state(state: &DesiredState) -> EncryptionConfiguration {
    let mut entries: Vec<(String, &GroupResourceState)> = state
        .iter()
        .map(|(gr, grs)| (gr.to_string(), grs))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let resources = entries
        .into_iter()
        .map(|(name, grs)| ResourceConfiguration {
            resources: vec![name],
            providers: state_to_providers(grs),
        })
        .collect();
    EncryptionConfiguration::new(resources)
}

fn state_to_providers(state: &GroupResourceState) -> Vec<Provider> {
    let ordered = state.write_key.iter().chain(
        state
            .read_keys
            .iter()
            .filter(|k| state.write_key.as_ref().is_none_or(|w| !w.same_key(k))),
    );

    let mut providers = Vec::new();
    let mut carriers = Vec::new();
    // without a write key, or with an identity write key, new data is stored in plaintext
    if state
        .write_key
        .as_ref()
        .is_none_or(|w| w.mode == Mode::Identity)
    {
        providers.push(Provider::Identity(IdentityConfiguration::default()));
    }
    for key in ordered {
        match key.mode {
            Mode::AesCbc | Mode::SecretBox => {
                providers.push(Provider::single(key.mode, key.key.clone()));
            }
            Mode::Identity => carriers.push(Provider::single(Mode::Identity, key.key.clone())),
        }
    }
    if !matches!(providers.first(), Some(Provider::Identity(_))) {
        providers.push(Provider::Identity(IdentityConfiguration::default()));
    }
    providers.extend(carriers);
    providers
}

/// Resolve a configuration back into per-resource key state.
///
/// Keys are matched against `backed_keys` by name and material; a key without a
/// match is kept as an unbacked key.
pub fn to_encryption_state(
    config: &EncryptionConfiguration,
    backed_keys: &[KeyState],
) -> DesiredState {
    let resolve = |mode: Mode, key: &Key| {
        backed_keys
            .iter()
            .find(|k| k.key == *key)
            .cloned()
            .unwrap_or_else(|| KeyState::unbacked(key.clone(), mode))
    };

    let mut state = DesiredState::new();
    for entry in &config.resources {
        let mut grs = GroupResourceState::default();
        let mut identity_write = false;
        for (position, provider) in entry.providers.iter().enumerate() {
            let (mode, keys) = match provider {
                Provider::Identity(_) => {
                    identity_write |= position == 0;
                    continue;
                }
                Provider::Aescbc(c) => (Mode::AesCbc, &c.keys),
                Provider::Secretbox(c) => (Mode::SecretBox, &c.keys),
                Provider::Aesgcm(c) => (Mode::Identity, &c.keys),
            };
            // a carrier behind a leading identity provider reads back as the write key,
            // even when the state it came from had none; both store new data in plaintext
            for key in keys {
                let ks = resolve(mode, key);
                let is_write = grs.write_key.is_none()
                    && ((position == 0 && !identity_write)
                        || (identity_write && mode == Mode::Identity));
                if is_write {
                    grs.write_key = Some(ks.clone());
                }
                grs.read_keys.push(ks);
            }
        }
        for name in &entry.resources {
            state.insert(GroupResource::parse(name), grs.clone());
        }
    }
    state
}

/// Name of a revisioned configuration secret in the target namespace
pub fn revisioned_secret_name(revision: &str) -> String {
    format!("{ENCRYPTION_CONFIG_SECRET_PREFIX}-{revision}")
}

/// Name of the published configuration secret in the key namespace
pub fn published_secret_name(target_namespace: &str) -> String {
    format!("{ENCRYPTION_CONFIG_SECRET_PREFIX}-{target_namespace}")
}

pub fn to_secret(
    namespace: &str,
    name: &str,
    config: &EncryptionConfiguration,
) -> Result<Secret, ConfigError> {
    let raw = serde_json::to_vec(config)?;
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            ENCRYPTION_CONFIG_DATA_KEY.to_string(),
            ByteString(raw),
        )])),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    })
}

pub fn from_secret(secret: &Secret) -> Result<EncryptionConfiguration, ConfigError> {
    let name = secret.metadata.name.clone().unwrap_or_default();
    let raw = secret
        .data
        .as_ref()
        .and_then(|d| d.get(ENCRYPTION_CONFIG_DATA_KEY))
        .ok_or_else(|| ConfigError::MissingData(name.clone()))?;
    serde_json::from_slice(&raw.0).map_err(|source| ConfigError::Parse { name, source })
}
