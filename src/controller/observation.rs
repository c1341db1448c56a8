//! # Pod-State Observation Controller
//!
//! Once every instance runs one revision, stamps the keys of that revision's
//! configuration as observed for reads, and its write keys as observed for writes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use super::context::{ControllerContext, ReconcileOutcome};
use super::error::ControllerError;
use super::preconditions::{defer, load_snapshot, Preconditions};
use super::retry::update_with_retry;
use super::KeyLifecycleController;
use crate::constants::{ANNOTATION_READ_TIMESTAMP, ANNOTATION_WRITE_TIMESTAMP};
use crate::encryption::codec;

#[derive(Debug, Default)]
pub struct ObservationController;

#[async_trait]
impl KeyLifecycleController for ObservationController {
    fn name(&self) -> &'static str {
        "EncryptionPodStateController"
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

        // key secret name -> (read observed, write observed)
        let mut observed: BTreeMap<String, (bool, bool)> = BTreeMap::new();
        for grs in snapshot.running_state().values() {
            for key in grs.backed_read_keys() {
                let Some(record) = snapshot.record_for(key) else {
                    continue;
                };
                let entry = observed.entry(record.name().to_string()).or_default();
                entry.0 |= key.read_observed.is_none();
                entry.1 |= grs.is_write_key(key) && key.write_observed.is_none();
            }
        }

        let now = Utc::now();
        let mut errors = Vec::new();
        for (name, (read, write)) in observed {
            if !read && !write {
                continue;
            }
            let result = update_with_retry(
                ctx.secrets.as_ref(),
                &config.key_namespace,
                &name,
                config.conflict_retry_attempts,
                |secret| {
                    let mut changed = false;
                    if read {
                        changed |= codec::stamp_if_absent(secret, ANNOTATION_READ_TIMESTAMP, now);
                    }
                    if write {
                        changed |= codec::stamp_if_absent(secret, ANNOTATION_WRITE_TIMESTAMP, now);
                    }
                    Ok(changed)
                },
            )
            .await;
            match result {
                Ok(true) => debug!(secret = %name, read, write, "Marked key as observed"),
                Ok(false) => {}
                Err(e) => {
                    warn!(secret = %name, error = %e, "Failed to mark key as observed");
                    errors.push(e);
                }
            }
        }

        ControllerError::aggregate(errors)?;
        Ok(ReconcileOutcome::Done)
    }
}
