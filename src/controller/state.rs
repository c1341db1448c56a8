//! # State Aggregation Controller
//!
//! Publishes the desired encryption configuration to the well-known secret the
//! revision machinery copies to the instances.

use async_trait::async_trait;
use kube::runtime::events::EventType;
use tracing::{debug, info};

use super::context::{ControllerContext, ReconcileOutcome};
use super::error::ControllerError;
use super::preconditions::{defer, load_snapshot, Preconditions};
use super::KeyLifecycleController;
use crate::encryption::config::{self as wire, published_secret_name};
use crate::observability::metrics;
use crate::store::{actions, reasons};

#[derive(Debug, Default)]
pub struct StateController;

#[async_trait]
impl KeyLifecycleController for StateController {
    fn name(&self) -> &'static str {
        "EncryptionStateController"
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

        if snapshot.desired.is_empty() {
            debug!("Desired state is empty, not publishing");
            return Ok(ReconcileOutcome::Done);
        }

        let desired = snapshot.desired_config();
        let name = published_secret_name(&config.target_namespace);

        let written = match &snapshot.published {
            None => {
                let secret = wire::to_secret(&config.key_namespace, &name, &desired)?;
                ctx.secrets.create(&config.key_namespace, &secret).await?;
                true
            }
            Some(existing) => {
                // an unreadable published configuration is overwritten
                let current = wire::from_secret(existing).ok();
                if current.as_ref() == Some(&desired) {
                    false
                } else {
                    let mut secret = wire::to_secret(&config.key_namespace, &name, &desired)?;
                    secret.metadata.resource_version = existing.metadata.resource_version.clone();
                    secret.metadata.labels = existing.metadata.labels.clone();
                    secret.metadata.annotations = existing.metadata.annotations.clone();
                    ctx.secrets.update(&config.key_namespace, &secret).await?;
                    true
                }
            }
        };

        if written {
            info!(
                secret = %name,
                resources = desired.resources.len(),
                "Published encryption configuration"
            );
            metrics::increment_config_updates();
            ctx.events
                .publish(
                    &ctx.policy_reference().await,
                    EventType::Normal,
                    reasons::CONFIG_UPDATED,
                    actions::PUBLISH,
                    Some(format!("Updated encryption configuration {name}")),
                )
                .await;
        }

        Ok(ReconcileOutcome::Done)
    }
}
