//! # Key Minting Controller
//!
//! Decides when a new key is needed and creates it. At most one key is minted per
//! reconciliation; its ID is one above the highest ID of any key object.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use kube::runtime::events::EventType;
use tracing::{error, info};

use super::context::{ControllerContext, ReconcileOutcome};
use super::error::ControllerError;
use super::preconditions::{defer, load_snapshot, Preconditions};
use super::KeyLifecycleController;
use crate::config::ControllerConfig;
use crate::constants::LABEL_COMPONENT;
use crate::encryption::codec;
use crate::encryption::{GroupResource, GroupResourceState, Key, KeyState, MigrationState, Mode};
use crate::observability::metrics;
use crate::store::{actions, reasons, StoreError};

pub const REASON_KEY_DOES_NOT_EXIST: &str = "key-does-not-exist";
pub const REASON_MODE_CHANGED: &str = "encryption-mode-changed";
pub const REASON_EXTERNAL_REASON_CHANGED: &str = "external-reason-changed";
pub const REASON_TIMESTAMP_TOO_OLD: &str = "timestamp-too-old";

/// Outcome of [`needs_new_key`] when a key must be minted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDecision {
    /// ID of the latest key of the resource type, 0 when there is none
    pub after_key_id: u64,
    pub reason: &'static str,
}

/// Whether the resource type needs a new key.
///
/// Refuses while more than one backed read key is pending migration and while the
/// latest key has not been migrated yet.
pub fn needs_new_key(
    grs: &GroupResourceState,
    mode: Mode,
    external_reason: &str,
    previously_enabled: bool,
    rotation_interval: Duration,
    now: DateTime<Utc>,
) -> Option<KeyDecision> {
    let backed: Vec<&KeyState> = grs.backed_read_keys().collect();
    if backed.len() > 1 {
        return None;
    }

    let Some(latest) = backed.first() else {
        if mode == Mode::Identity && !previously_enabled {
            return None;
        }
        return Some(KeyDecision {
            after_key_id: 0,
            reason: REASON_KEY_DOES_NOT_EXIST,
        });
    };
    let decision = |reason| {
        Some(KeyDecision {
            after_key_id: latest.key_id().unwrap_or(0),
            reason,
        })
    };

    let migrated_at = latest.migrated.timestamp?;

    if latest.mode != mode {
        return decision(REASON_MODE_CHANGED);
    }
    if latest.mode == Mode::Identity {
        return None;
    }
    if !external_reason.is_empty() && latest.external_reason != external_reason {
        return decision(REASON_EXTERNAL_REASON_CHANGED);
    }

    let age = now.signed_duration_since(migrated_at);
    let too_old = chrono::Duration::from_std(rotation_interval)
        .map(|interval| age > interval)
        .unwrap_or(false);
    if too_old {
        return decision(REASON_TIMESTAMP_TOO_OLD);
    }
    None
}

#[derive(Debug, Default)]
pub struct KeyController;

#[async_trait]
impl KeyLifecycleController for KeyController {
    fn name(&self) -> &'static str {
        "EncryptionKeyController"
    }

    async fn reconcile(&self, ctx: &ControllerContext) -> Result<ReconcileOutcome, ControllerError> {
        let config = ctx.config.read().await.clone();
        let snapshot = match load_snapshot(ctx).await? {
            Preconditions::Disabled => return Ok(ReconcileOutcome::Done),
            Preconditions::Transitioning { reason, message } => {
                return Ok(defer(
                    self.name(),
                    reason,
                    &message,
                    config.unconverged_requeue_duration(),
                ))
            }
            Preconditions::Ready(snapshot) => snapshot,
        };

        let rotation_interval = snapshot
            .policy
            .rotation_interval()
            .unwrap_or_else(|| config.rotation_interval_duration());
        let now = Utc::now();

        for (gr, grs) in &snapshot.desired {
            let Some(decision) = needs_new_key(
                grs,
                snapshot.policy.mode,
                &snapshot.policy.reason,
                snapshot.previously_enabled,
                rotation_interval,
                now,
            ) else {
                continue;
            };

            let key_id = snapshot.max_key_id() + 1;
            info!(
                resource = %gr,
                key_id,
                after_key_id = decision.after_key_id,
                reason = decision.reason,
                mode = %snapshot.policy.mode,
                "Minting new encryption key"
            );
            mint(
                ctx,
                &config,
                gr,
                key_id,
                snapshot.policy.mode,
                decision.reason,
                &snapshot.policy.reason,
            )
            .await?;
            break;
        }

        Ok(ReconcileOutcome::Done)
    }
}

async fn mint(
    ctx: &ControllerContext,
    config: &ControllerConfig,
    gr: &GroupResource,
    key_id: u64,
    mode: Mode,
    internal_reason: &str,
    external_reason: &str,
) -> Result<(), ControllerError> {
    let state = KeyState {
        key: Key::new(key_id.to_string(), STANDARD.encode(mode.generate_key())),
        mode,
        backed: true,
        migrated: MigrationState::default(),
        read_observed: None,
        write_observed: None,
        internal_reason: internal_reason.to_string(),
        external_reason: external_reason.to_string(),
    };
    let secret = codec::encode(&config.component, &config.key_namespace, gr, &state)?;
    let name = codec::key_secret_name(&config.component, gr, key_id);

    match ctx.secrets.create(&config.key_namespace, &secret).await {
        Ok(_) => {
            metrics::increment_keys_created(mode.as_str());
            ctx.events
                .publish(
                    &ctx.policy_reference().await,
                    EventType::Normal,
                    reasons::KEY_CREATED,
                    actions::MINT,
                    Some(format!(
                        "Created key {name} for {gr} with mode {mode} ({internal_reason})"
                    )),
                )
                .await;
            Ok(())
        }
        Err(e) if e.is_already_exists() => {
            validate_existing(ctx, config, &name, gr, key_id, mode).await
        }
        Err(e) => Err(e.into()),
    }
}

/// A key object with the minted name already exists. It must be what this controller
/// would have created; anything else needs manual intervention.
async fn validate_existing(
    ctx: &ControllerContext,
    config: &ControllerConfig,
    name: &str,
    gr: &GroupResource,
    key_id: u64,
    mode: Mode,
) -> Result<(), ControllerError> {
    let Some(existing) = ctx.secrets.get(&config.key_namespace, name).await? else {
        return Err(StoreError::NotFound(format!(
            "secret {}/{name} reported as existing",
            config.key_namespace
        ))
        .into());
    };

    let mismatch = match codec::decode(&existing) {
        Err(e) => Some(e.to_string()),
        Ok(decoded) => {
            let component = existing
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(LABEL_COMPONENT));
            if component.map(String::as_str) != Some(config.component.as_str()) {
                Some(format!("component label is {component:?}"))
            } else if decoded.group_resource != *gr {
                Some(format!("resource type is {}", decoded.group_resource))
            } else if decoded.key_id != key_id {
                Some(format!("key ID is {}", decoded.key_id))
            } else if decoded.state.mode != mode {
                Some(format!("mode is {}", decoded.state.mode))
            } else {
                None
            }
        }
    };

    let Some(reason) = mismatch else {
        info!(secret = name, "Key already created concurrently");
        return Ok(());
    };

    error!(
        secret = name,
        reason = %reason,
        "Existing key secret does not match the key that would have been minted"
    );
    ctx.events
        .publish(
            &ctx.policy_reference().await,
            EventType::Warning,
            reasons::KEY_INTEGRITY_VIOLATION,
            actions::MINT,
            Some(format!("Key secret {name} is invalid: {reason}")),
        )
        .await;
    Err(ControllerError::KeyIntegrity {
        name: name.to_string(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const WEEK: Duration = Duration::from_secs(7 * 24 * 3600);

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn key(id: u64, mode: Mode, migrated_hours_ago: Option<i64>) -> KeyState {
        KeyState {
            backed: true,
            migrated: MigrationState {
                timestamp: migrated_hours_ago.map(|h| now() - chrono::Duration::hours(h)),
                resources: vec![GroupResource::core("secrets")],
            },
            ..KeyState::unbacked(
                Key::new(id.to_string(), STANDARD.encode(mode.generate_key())),
                mode,
            )
        }
    }

    fn single(key: KeyState) -> GroupResourceState {
        GroupResourceState {
            write_key: Some(key.clone()),
            read_keys: vec![key],
        }
    }

    #[test]
    fn test_cold_start_identity_stays_disabled() {
        let grs = GroupResourceState::default();
        assert!(needs_new_key(&grs, Mode::Identity, "", false, WEEK, now()).is_none());
    }

    #[test]
    fn test_no_keys_after_enablement_mints() {
        let grs = GroupResourceState::default();
        let decision = needs_new_key(&grs, Mode::Identity, "", true, WEEK, now()).unwrap();
        assert_eq!(decision.reason, REASON_KEY_DOES_NOT_EXIST);
        let decision = needs_new_key(&grs, Mode::AesCbc, "", false, WEEK, now()).unwrap();
        assert_eq!(decision.after_key_id, 0);
    }

    #[test]
    fn test_recently_migrated_key_is_kept() {
        let grs = single(key(3, Mode::AesCbc, Some(1)));
        assert!(needs_new_key(&grs, Mode::AesCbc, "", true, WEEK, now()).is_none());
    }

    #[test]
    fn test_old_key_rotates() {
        let grs = single(key(3, Mode::AesCbc, Some(8 * 24)));
        let decision = needs_new_key(&grs, Mode::AesCbc, "", true, WEEK, now()).unwrap();
        assert_eq!(
            decision,
            KeyDecision {
                after_key_id: 3,
                reason: REASON_TIMESTAMP_TOO_OLD
            }
        );
    }

    #[test]
    fn test_unmigrated_key_blocks_rotation() {
        let grs = single(key(3, Mode::AesCbc, None));
        assert!(needs_new_key(&grs, Mode::SecretBox, "now", true, WEEK, now()).is_none());
    }

    #[test]
    fn test_pending_migration_applies_back_pressure() {
        let newer = key(4, Mode::AesCbc, Some(8 * 24));
        let older = key(3, Mode::AesCbc, Some(20 * 24));
        let grs = GroupResourceState {
            write_key: Some(newer.clone()),
            read_keys: vec![newer, older],
        };
        assert!(needs_new_key(&grs, Mode::SecretBox, "", true, WEEK, now()).is_none());
    }

    #[test]
    fn test_mode_change_rotates() {
        let grs = single(key(3, Mode::AesCbc, Some(1)));
        let decision = needs_new_key(&grs, Mode::SecretBox, "", true, WEEK, now()).unwrap();
        assert_eq!(decision.reason, REASON_MODE_CHANGED);
    }

    #[test]
    fn test_identity_steady_state() {
        let grs = single(key(3, Mode::Identity, Some(24 * 30)));
        assert!(needs_new_key(&grs, Mode::Identity, "rotate", true, WEEK, now()).is_none());
    }

    #[test]
    fn test_external_reason_rotates_once() {
        let grs = single(key(3, Mode::AesCbc, Some(1)));
        let decision = needs_new_key(&grs, Mode::AesCbc, "incident-42", true, WEEK, now()).unwrap();
        assert_eq!(decision.reason, REASON_EXTERNAL_REASON_CHANGED);

        let mut rotated = key(4, Mode::AesCbc, Some(1));
        rotated.external_reason = "incident-42".to_string();
        let grs = single(rotated);
        assert!(needs_new_key(&grs, Mode::AesCbc, "incident-42", true, WEEK, now()).is_none());
    }

    #[test]
    fn test_empty_external_reason_never_rotates() {
        let mut latest = key(3, Mode::AesCbc, Some(1));
        latest.external_reason = "old-reason".to_string();
        assert!(needs_new_key(&single(latest), Mode::AesCbc, "", true, WEEK, now()).is_none());
    }

    #[test]
    fn test_unbacked_keys_are_ignored() {
        let unbacked = KeyState::unbacked(Key::new("9", "AAAA"), Mode::AesCbc);
        let grs = GroupResourceState {
            write_key: Some(unbacked.clone()),
            read_keys: vec![unbacked],
        };
        let decision = needs_new_key(&grs, Mode::AesCbc, "", true, WEEK, now()).unwrap();
        assert_eq!(decision.reason, REASON_KEY_DOES_NOT_EXIST);
    }
}
