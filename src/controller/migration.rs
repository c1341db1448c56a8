//! # Migration Controller
//!
//! Once every instance runs the desired configuration, rewrites all stored objects of
//! each resource type whose write key has not migrated it yet, then records the
//! resource type on the write key.
//!
//! Objects are streamed page by page; a full listing is never held in memory.

use async_trait::async_trait;
use chrono::Utc;
use kube::runtime::events::EventType;
use tracing::{debug, info, warn};

use super::context::{ControllerContext, ReconcileOutcome};
use super::error::ControllerError;
use super::preconditions::{defer, load_snapshot, Preconditions};
use super::retry::update_with_retry;
use super::KeyLifecycleController;
use crate::config::ControllerConfig;
use crate::crd::Condition;
use crate::encryption::{codec, GroupResource, KeyState};
use crate::observability::metrics;
use crate::store::{actions, reasons};

pub const CONDITION_PROGRESSING: &str = "EncryptionMigrationControllerProgressing";

#[derive(Debug, Default)]
pub struct MigrationController;

#[async_trait]
impl KeyLifecycleController for MigrationController {
    fn name(&self) -> &'static str {
        "EncryptionMigrationController"
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

        if !snapshot.config_converged() {
            info!(
                revision = %snapshot.revision,
                "Instances do not run the desired encryption configuration yet"
            );
            return Ok(ReconcileOutcome::RequeueAfter(
                config.unconverged_requeue_duration(),
            ));
        }

        let pending: Vec<(GroupResource, KeyState)> = snapshot
            .desired
            .iter()
            .filter_map(|(gr, grs)| {
                let write = grs.write_key.as_ref()?;
                (write.backed && !write.migrated.includes(gr)).then(|| (gr.clone(), write.clone()))
            })
            .collect();

        if pending.is_empty() {
            ctx.conditions
                .set_condition(Condition::new(
                    CONDITION_PROGRESSING,
                    false,
                    "AsExpected",
                    "All resources are encrypted with the current write key",
                ))
                .await;
            return Ok(ReconcileOutcome::Done);
        }

        let names: Vec<String> = pending.iter().map(|(gr, _)| gr.to_string()).collect();
        ctx.conditions
            .set_condition(Condition::new(
                CONDITION_PROGRESSING,
                true,
                "Migrating",
                format!("Migrating {} to the current write key", names.join(", ")),
            ))
            .await;

        let mut errors = Vec::new();
        for (gr, write_key) in &pending {
            let Some(record) = snapshot.record_for(write_key) else {
                continue;
            };
            let key_secret = record.name().to_string();

            let result = async {
                let rewritten = migrate_resource(ctx, &config, gr).await?;
                record_migration(ctx, &config, &key_secret, gr).await?;
                Ok::<u64, ControllerError>(rewritten)
            }
            .await;

            match result {
                Ok(rewritten) => {
                    info!(resource = %gr, key = %key_secret, rewritten, "Storage migration completed");
                    metrics::increment_migrations_completed(&gr.to_string());
                    ctx.events
                        .publish(
                            &ctx.policy_reference().await,
                            EventType::Normal,
                            reasons::MIGRATION_SUCCEEDED,
                            actions::MIGRATE,
                            Some(format!("Migrated {rewritten} {gr} to key {key_secret}")),
                        )
                        .await;
                }
                Err(e) => {
                    warn!(resource = %gr, error = %e, "Storage migration failed");
                    ctx.events
                        .publish(
                            &ctx.policy_reference().await,
                            EventType::Warning,
                            reasons::MIGRATION_FAILED,
                            actions::MIGRATE,
                            Some(format!("Migration of {gr} failed: {e}")),
                        )
                        .await;
                    errors.push(e);
                }
            }
        }

        ControllerError::aggregate(errors)?;

        ctx.conditions
            .set_condition(Condition::new(
                CONDITION_PROGRESSING,
                false,
                "AsExpected",
                "All resources are encrypted with the current write key",
            ))
            .await;
        Ok(ReconcileOutcome::Done)
    }
}

/// Rewrite every stored object of `gr`. Returns the number of objects rewritten.
///
/// Objects deleted or updated concurrently are skipped: their owner's write already
/// used the current write key.
async fn migrate_resource(
    ctx: &ControllerContext,
    config: &ControllerConfig,
    gr: &GroupResource,
) -> Result<u64, ControllerError> {
    let mut continue_token: Option<String> = None;
    let mut rewritten = 0u64;
    loop {
        let page = ctx
            .migrator
            .list_page(gr, continue_token.as_deref(), config.migration_page_size)
            .await?;
        let mut page_rewritten = 0u64;
        for object in &page.items {
            match ctx.migrator.rewrite(gr, object).await {
                Ok(()) => page_rewritten += 1,
                Err(e) if e.is_not_found() || e.is_conflict() => {
                    debug!(resource = %gr, error = %e, "Skipping concurrently modified object");
                }
                Err(e) => return Err(e.into()),
            }
        }
        metrics::increment_migrated_objects(&gr.to_string(), page_rewritten);
        rewritten += page_rewritten;

        match page.continue_token {
            Some(token) => continue_token = Some(token),
            None => return Ok(rewritten),
        }
    }
}

async fn record_migration(
    ctx: &ControllerContext,
    config: &ControllerConfig,
    key_secret: &str,
    gr: &GroupResource,
) -> Result<(), ControllerError> {
    let now = Utc::now();
    update_with_retry(
        ctx.secrets.as_ref(),
        &config.key_namespace,
        key_secret,
        config.conflict_retry_attempts,
        |secret| {
            codec::record_migration(secret, gr, now).map_err(|e| ControllerError::KeyIntegrity {
                name: key_secret.to_string(),
                reason: e.to_string(),
            })
        },
    )
    .await?;
    Ok(())
}
