//! # Controller
//!
//! The five cooperating encryption key controllers and what they share.
//!
//! - `key`: mints new keys
//! - `state`: publishes the desired encryption configuration
//! - `migration`: rewrites stored objects with the current write key
//! - `observation`: records which keys every instance has observed
//! - `prune`: deletes keys nothing references anymore
//!
//! Every controller recomputes its inputs from the stores on each pass. Ordering
//! between controllers is carried only by the state of key objects and
//! configuration secrets.

pub mod backoff;
pub mod context;
pub mod error;
pub mod key;
pub mod migration;
pub mod observation;
pub mod preconditions;
pub mod prune;
pub mod retry;
pub mod state;

use std::sync::Arc;

use async_trait::async_trait;

pub use context::{ControllerContext, ReconcileOutcome};
pub use error::ControllerError;
pub use key::KeyController;
pub use migration::MigrationController;
pub use observation::ObservationController;
pub use prune::PruneController;
pub use state::StateController;

/// One reconciliation loop of the key lifecycle
#[async_trait]
pub trait KeyLifecycleController: Send + Sync {
    /// Name used for conditions, metrics and logs
    fn name(&self) -> &'static str;

    /// Run a single pass against the current cluster state
    async fn reconcile(&self, ctx: &ControllerContext) -> Result<ReconcileOutcome, ControllerError>;
}

/// Every controller of the key lifecycle, in the order they are started
pub fn all_controllers() -> Vec<Arc<dyn KeyLifecycleController>> {
    vec![
        Arc::new(KeyController),
        Arc::new(StateController),
        Arc::new(MigrationController),
        Arc::new(ObservationController),
        Arc::new(PruneController),
    ]
}

/// Name of the degraded condition a controller reports
pub fn degraded_condition_type(controller: &str) -> String {
    format!("{controller}Degraded")
}
