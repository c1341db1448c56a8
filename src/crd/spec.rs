//! # EncryptionPolicy Spec
//!
//! Cluster-scoped policy describing what should be encrypted and how.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::encryption::{default_group_resources, GroupResource, Mode};

/// EncryptionPolicy Custom Resource Definition
///
/// Declares the encryption mode and the resource types the API servers should
/// encrypt at rest. The controllers read the policy named by `POLICY_NAME`.
///
/// # Example
///
/// ```yaml
/// apiVersion: encryption.octopilot.io/v1alpha1
/// kind: EncryptionPolicy
/// metadata:
///   name: cluster
/// spec:
///   mode: aescbc
///   resources:
///     - resource: secrets
///     - resource: configmaps
///     - group: route.openshift.io
///       resource: routes
///   reason: rotate-after-incident-1234
///   rotationInterval: 7d
/// ```
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "EncryptionPolicy",
    group = "encryption.octopilot.io",
    version = "v1alpha1",
    status = "crate::crd::EncryptionPolicyStatus",
    shortname = "encpol",
    printcolumn = r#"{"name":"Mode", "type":"string", "jsonPath":".spec.mode"}, {"name":"Migrating", "type":"string", "jsonPath":".status.conditions[?(@.type==\"EncryptionMigrationControllerProgressing\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionPolicySpec {
    /// Encryption mode for newly minted keys
    /// Values: aescbc, secretbox, identity (encryption disabled)
    /// Default: identity
    #[serde(default = "default_mode")]
    pub mode: Mode,
    /// Resource types to encrypt
    /// Default: secrets and configmaps
    #[serde(default = "default_resources")]
    pub resources: Vec<GroupResource>,
    /// Administrator supplied rotation reason
    /// Changing it to a new non-empty value forces a key rotation
    #[serde(default)]
    pub reason: String,
    /// Time-based rotation interval
    /// Format: Kubernetes duration string (e.g., "168h", "7d")
    /// Default: controller setting ROTATION_INTERVAL_SECS (one week)
    #[serde(default)]
    pub rotation_interval: Option<String>,
}

impl Default for EncryptionPolicySpec {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            resources: default_resources(),
            reason: String::new(),
            rotation_interval: None,
        }
    }
}

impl EncryptionPolicySpec {
    /// Parsed rotation interval, `None` when unset or invalid
    pub fn rotation_interval(&self) -> Option<Duration> {
        let raw = self.rotation_interval.as_deref()?;
        match super::parse_kubernetes_duration(raw) {
            Ok(interval) => Some(interval),
            Err(e) => {
                tracing::warn!(rotation_interval = raw, error = %e, "Ignoring invalid rotationInterval");
                None
            }
        }
    }
}

/// Default value for mode
pub fn default_mode() -> Mode {
    Mode::Identity
}

/// Default value for resources
pub fn default_resources() -> Vec<GroupResource> {
    default_group_resources()
}
