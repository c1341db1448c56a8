//! # Prune Controller
//!
//! Deletes key objects no configuration references anymore, keeping the newest
//! `KEEP_NUMBER_OF_SECRETS` unused keys for backup decryption.
//!
//! Deletion is two-phase: the deletion guard is removed with an update first, then
//! the object is deleted. Both steps treat "already gone" as done.

use std::collections::BTreeSet;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::events::EventType;
use tracing::{debug, info, warn};

use super::context::{ControllerContext, ReconcileOutcome};
use super::error::ControllerError;
use super::preconditions::{defer, load_snapshot, EncryptionSnapshot, Preconditions};
use super::retry::update_with_retry;
use super::KeyLifecycleController;
use crate::encryption::codec;
use crate::encryption::config::{self as wire, to_encryption_state};
use crate::encryption::state::referenced_read_keys;
use crate::encryption::DesiredState;
use crate::observability::metrics;
use crate::store::{actions, reasons};

/// Where a key object is in the deletion protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionPhase {
    /// The deletion guard is still present
    Guarded,
    /// Guard removed, object still exists
    Unguarded,
    Deleted,
}

impl DeletionPhase {
    pub fn of(secret: Option<&Secret>) -> Self {
        match secret {
            None => DeletionPhase::Deleted,
            Some(secret) if codec::has_deletion_guard(secret) => DeletionPhase::Guarded,
            Some(_) => DeletionPhase::Unguarded,
        }
    }
}

/// Key object names no desired, running or published configuration reads with,
/// minus the newest `keep` of them. Candidates are considered newest first.
pub fn deletion_candidates(snapshot: &EncryptionSnapshot, keep: usize) -> Vec<String> {
    let mut states: Vec<DesiredState> = vec![snapshot.desired.clone(), snapshot.running_state()];
    if let Some(published) = snapshot
        .published
        .as_ref()
        .and_then(|secret| wire::from_secret(secret).ok())
    {
        states.push(to_encryption_state(&published, &snapshot.key_states()));
    }

    let referenced: BTreeSet<&str> = states
        .iter()
        .flat_map(|state| {
            let mut names: Vec<&str> = referenced_read_keys(state)
                .into_iter()
                .map(|k| k.key.name.as_str())
                .collect();
            names.extend(
                state
                    .values()
                    .filter_map(|grs| grs.write_key.as_ref())
                    .map(|k| k.key.name.as_str()),
            );
            names
        })
        .collect();

    snapshot
        .keys
        .iter()
        .filter(|record| !referenced.contains(record.key.state.key.name.as_str()))
        .skip(keep)
        .map(|record| record.name().to_string())
        .collect()
}

#[derive(Debug, Default)]
pub struct PruneController;

#[async_trait]
impl KeyLifecycleController for PruneController {
    fn name(&self) -> &'static str {
        "EncryptionPruneController"
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

        let candidates = deletion_candidates(&snapshot, config.keep_number_of_secrets);
        if candidates.is_empty() {
            debug!("No key secrets to prune");
            return Ok(ReconcileOutcome::Done);
        }

        let mut errors = Vec::new();
        for name in candidates {
            match delete_key(ctx, &config.key_namespace, &name).await {
                Ok(()) => {
                    info!(secret = %name, "Pruned unused key secret");
                    metrics::increment_keys_pruned();
                    ctx.events
                        .publish(
                            &ctx.policy_reference().await,
                            EventType::Normal,
                            reasons::KEY_PRUNED,
                            actions::PRUNE,
                            Some(format!("Deleted unused key secret {name}")),
                        )
                        .await;
                }
                Err(e) => {
                    warn!(secret = %name, error = %e, "Failed to prune key secret");
                    errors.push(e);
                }
            }
        }

        ControllerError::aggregate(errors)?;
        Ok(ReconcileOutcome::Done)
    }
}

/// Drive one key object through the deletion protocol
async fn delete_key(
    ctx: &ControllerContext,
    namespace: &str,
    name: &str,
) -> Result<(), ControllerError> {
    let attempts = ctx.config.read().await.conflict_retry_attempts;
    let mut phase = DeletionPhase::of(ctx.secrets.get(namespace, name).await?.as_ref());
    while phase != DeletionPhase::Deleted {
        phase = match phase {
            DeletionPhase::Guarded => {
                match update_with_retry(ctx.secrets.as_ref(), namespace, name, attempts, |s| {
                    Ok(codec::remove_deletion_guard(s))
                })
                .await
                {
                    Ok(_) => DeletionPhase::Unguarded,
                    Err(ControllerError::Store(e)) if e.is_not_found() => DeletionPhase::Deleted,
                    Err(e) => return Err(e),
                }
            }
            DeletionPhase::Unguarded => match ctx.secrets.delete(namespace, name).await {
                Ok(()) => DeletionPhase::Deleted,
                Err(e) if e.is_not_found() => DeletionPhase::Deleted,
                Err(e) => return Err(e.into()),
            },
            DeletionPhase::Deleted => DeletionPhase::Deleted,
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::KEY_FINALIZER;
    use kube::api::ObjectMeta;

    fn secret(finalizers: Option<Vec<&str>>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("key".to_string()),
                finalizers: finalizers.map(|f| f.into_iter().map(String::from).collect()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_deletion_phase() {
        assert_eq!(DeletionPhase::of(None), DeletionPhase::Deleted);
        assert_eq!(
            DeletionPhase::of(Some(&secret(Some(vec![KEY_FINALIZER])))),
            DeletionPhase::Guarded
        );
        assert_eq!(
            DeletionPhase::of(Some(&secret(Some(vec!["other"])))),
            DeletionPhase::Unguarded
        );
        assert_eq!(DeletionPhase::of(Some(&secret(None))), DeletionPhase::Unguarded);
    }
}
