//! # Encryption Snapshot
//!
//! Every controller starts by loading the same snapshot: the policy, the decoded key
//! objects, the revision all instances converged on, the configuration they run and
//! the desired state computed from all of it. Nothing is kept between reconciliations.

use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use tracing::{debug, info};

use super::context::{ControllerContext, ReconcileOutcome};
use super::error::ControllerError;
use crate::crd::EncryptionPolicySpec;
use crate::encryption::codec::{self, DecodedKey};
use crate::encryption::config::{
    self as wire, from_encryption_state, published_secret_name, revisioned_secret_name,
};
use crate::encryption::{
    compute_desired_state, converged_revision, ConvergenceSnapshot, DesiredState,
    EncryptionConfiguration, GroupResource, KeyState, Mode,
};
use crate::observability::metrics;

/// Reason reported while instances disagree on the revision they run
pub const REASON_NOT_CONVERGED: &str = "InstanceRevisionNotConverged";

/// A key object together with its decoded form
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub secret: Secret,
    pub key: DecodedKey,
}

impl KeyRecord {
    pub fn name(&self) -> &str {
        self.secret.metadata.name.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct EncryptionSnapshot {
    pub policy: EncryptionPolicySpec,
    /// Revision every instance runs
    pub revision: String,
    /// Configuration of that revision, `None` when it does not exist
    pub running: Option<EncryptionConfiguration>,
    /// Published configuration secret in the key namespace
    pub published: Option<Secret>,
    /// Decodable key objects, newest first
    pub keys: Vec<KeyRecord>,
    pub desired: DesiredState,
    /// Whether encryption was enabled at some point
    pub previously_enabled: bool,
}

impl EncryptionSnapshot {
    pub fn key_states(&self) -> Vec<KeyState> {
        self.keys.iter().map(|r| r.key.state.clone()).collect()
    }

    /// Key object backing a key of the desired or running state
    pub fn record_for(&self, key: &KeyState) -> Option<&KeyRecord> {
        self.keys.iter().find(|r| r.key.state.same_key(key))
    }

    /// Highest key ID among all decodable key objects, 0 when there are none
    pub fn max_key_id(&self) -> u64 {
        self.keys.iter().map(|r| r.key.key_id).max().unwrap_or(0)
    }

    /// Resource types with a desired state, sorted
    pub fn tracked_resources(&self) -> Vec<GroupResource> {
        self.desired.keys().cloned().collect()
    }

    pub fn desired_config(&self) -> EncryptionConfiguration {
        from_encryption_state(&self.desired)
    }

    /// Whether instances already run exactly the desired configuration
    pub fn config_converged(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| *running == self.desired_config())
    }

    /// Key state the instances run, resolved against the key objects
    pub fn running_state(&self) -> DesiredState {
        self.running
            .as_ref()
            .map(|running| wire::to_encryption_state(running, &self.key_states()))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub enum Preconditions {
    /// Encryption was never enabled; nothing to do
    Disabled,
    /// Instances are moving between revisions; try again later
    Transitioning { reason: &'static str, message: String },
    Ready(Box<EncryptionSnapshot>),
}

/// Outcome of a controller that found instances transitioning. The requeue is
/// counted under the transition reason.
pub fn defer(
    controller: &'static str,
    reason: &'static str,
    message: &str,
    delay: Duration,
) -> ReconcileOutcome {
    debug!(controller, reason, message, "Deferring until instances converge");
    metrics::increment_requeues_total(controller, reason);
    ReconcileOutcome::RequeueAfter(delay)
}

/// Load the snapshot every controller acts on
pub async fn load_snapshot(ctx: &ControllerContext) -> Result<Preconditions, ControllerError> {
    let config = ctx.config.read().await.clone();

    let policy = ctx
        .policies
        .get_policy(&config.policy_name)
        .await?
        .unwrap_or_default();

    let secrets = ctx
        .secrets
        .list(
            &config.key_namespace,
            &codec::component_selector(&config.component),
        )
        .await?;
    let mut keys: Vec<KeyRecord> = secrets
        .into_iter()
        .filter_map(|secret| match codec::decode(&secret) {
            Ok(key) => Some(KeyRecord { secret, key }),
            Err(e) => {
                debug!(
                    secret = secret.metadata.name.as_deref().unwrap_or("unknown"),
                    error = %e,
                    "Ignoring invalid key secret"
                );
                None
            }
        })
        .collect();
    keys.sort_by(|a, b| b.key.key_id.cmp(&a.key.key_id));

    let published = ctx
        .secrets
        .get(
            &config.key_namespace,
            &published_secret_name(&config.target_namespace),
        )
        .await?;

    let previously_enabled = !keys.is_empty() || published.is_some();
    if policy.mode == Mode::Identity && !previously_enabled {
        debug!("Encryption was never enabled, nothing to do");
        return Ok(Preconditions::Disabled);
    }

    let instances = ctx.instances.list_instances().await?;
    let revision = match converged_revision(&instances)? {
        ConvergenceSnapshot::Converged { revision } => revision,
        ConvergenceSnapshot::Unconverged { reason } => {
            info!(reason = %reason, "Instances have not converged on a revision");
            return Ok(Preconditions::Transitioning {
                reason: REASON_NOT_CONVERGED,
                message: reason,
            });
        }
    };

    let running = match ctx
        .secrets
        .get(&config.target_namespace, &revisioned_secret_name(&revision))
        .await?
    {
        Some(secret) => Some(wire::from_secret(&secret)?),
        None => {
            debug!(revision = %revision, "No encryption configuration for the running revision");
            None
        }
    };

    let key_states: Vec<KeyState> = keys.iter().map(|r| r.key.state.clone()).collect();
    let desired = compute_desired_state(running.as_ref(), &key_states, &policy.resources);

    Ok(Preconditions::Ready(Box::new(EncryptionSnapshot {
        policy,
        revision,
        running,
        published,
        keys,
        desired,
        previously_enabled,
    })))
}
